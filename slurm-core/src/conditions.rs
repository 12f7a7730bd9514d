//! Pod conditions mirroring the state of a pod's Slurm node.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::slurm::{NodeState, SlurmNode};

/// The prefix of every Slurm node state condition type.
pub const STATE_PREFIX: &str = "SlurmNodeState";

pub const POD_CONDITION_ALLOCATED: &str = "SlurmNodeStateAllocated";
pub const POD_CONDITION_DOWN: &str = "SlurmNodeStateDown";
pub const POD_CONDITION_ERROR: &str = "SlurmNodeStateError";
pub const POD_CONDITION_FUTURE: &str = "SlurmNodeStateFuture";
pub const POD_CONDITION_IDLE: &str = "SlurmNodeStateIdle";
pub const POD_CONDITION_MIXED: &str = "SlurmNodeStateMixed";
pub const POD_CONDITION_UNKNOWN: &str = "SlurmNodeStateUnknown";
pub const POD_CONDITION_COMPLETING: &str = "SlurmNodeStateCompleting";
pub const POD_CONDITION_DRAIN: &str = "SlurmNodeStateDrain";
pub const POD_CONDITION_FAIL: &str = "SlurmNodeStateFail";
pub const POD_CONDITION_INVALID: &str = "SlurmNodeStateInvalid";
pub const POD_CONDITION_INVALID_REG: &str = "SlurmNodeStateInvalidReg";
pub const POD_CONDITION_MAINTENANCE: &str = "SlurmNodeStateMaintenance";
pub const POD_CONDITION_NOT_RESPONDING: &str = "SlurmNodeStateNotResponding";
pub const POD_CONDITION_UNDRAIN: &str = "SlurmNodeStateUndrain";

/// The pod condition type of the given node state, if it is tracked.
pub fn condition_type(state: NodeState) -> Option<&'static str> {
    Some(match state {
        NodeState::Allocated => POD_CONDITION_ALLOCATED,
        NodeState::Down => POD_CONDITION_DOWN,
        NodeState::Error => POD_CONDITION_ERROR,
        NodeState::Future => POD_CONDITION_FUTURE,
        NodeState::Idle => POD_CONDITION_IDLE,
        NodeState::Mixed => POD_CONDITION_MIXED,
        NodeState::Unknown => POD_CONDITION_UNKNOWN,
        NodeState::Completing => POD_CONDITION_COMPLETING,
        NodeState::Drain => POD_CONDITION_DRAIN,
        NodeState::Fail => POD_CONDITION_FAIL,
        NodeState::Invalid => POD_CONDITION_INVALID,
        NodeState::InvalidReg => POD_CONDITION_INVALID_REG,
        NodeState::Maintenance => POD_CONDITION_MAINTENANCE,
        NodeState::NotResponding => POD_CONDITION_NOT_RESPONDING,
        NodeState::Undrain => POD_CONDITION_UNDRAIN,
        NodeState::Other => return None,
    })
}

/// Build the `True` conditions describing the given Slurm node, with the node reason as message.
pub fn node_conditions(node: &SlurmNode, now: DateTime<Utc>) -> Vec<PodCondition> {
    node.tracked_states()
        .into_iter()
        .filter_map(condition_type)
        .map(|type_| PodCondition {
            type_: type_.into(),
            status: "True".into(),
            message: (!node.reason.is_empty()).then(|| node.reason.clone()),
            last_probe_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
            reason: None,
        })
        .collect()
}

/// Check if the given pod status carries a `True` condition of the given type.
pub fn is_condition_true(status: Option<&PodStatus>, type_: &str) -> bool {
    status
        .and_then(|status| status.conditions.as_ref())
        .map(|conds| conds.iter().any(|cond| cond.type_ == type_ && cond.status == "True"))
        .unwrap_or(false)
}

/// Work is happening on the node.
pub fn is_node_busy(status: Option<&PodStatus>) -> bool {
    is_condition_true(status, POD_CONDITION_ALLOCATED)
        || is_condition_true(status, POD_CONDITION_MIXED)
        || is_condition_true(status, POD_CONDITION_COMPLETING)
}

pub fn is_node_drain(status: Option<&PodStatus>) -> bool {
    is_condition_true(status, POD_CONDITION_DRAIN) && !is_condition_true(status, POD_CONDITION_UNDRAIN)
}

pub fn is_node_drained(status: Option<&PodStatus>) -> bool {
    is_node_drain(status) && !is_node_busy(status)
}

pub fn is_node_draining(status: Option<&PodStatus>) -> bool {
    is_node_drain(status) && is_node_busy(status)
}
