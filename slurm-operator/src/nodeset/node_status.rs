//! Aggregation of Slurm node states into NodeSet counts & per-pod conditions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use slurm_core::conditions::{self, STATE_PREFIX};
use slurm_core::slurm::{NodeState, SlurmNode};

/// Counts of the Slurm nodes backing a NodeSet's pods, by state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlurmNodeStatus {
    pub total: i32,

    // Base states.
    pub allocated: i32,
    pub down: i32,
    pub error: i32,
    pub future: i32,
    pub idle: i32,
    pub mixed: i32,
    pub unknown: i32,

    // Flag states.
    pub completing: i32,
    pub drain: i32,
    pub fail: i32,
    pub invalid: i32,
    pub invalid_reg: i32,
    pub maintenance: i32,
    pub not_responding: i32,
    pub undrain: i32,

    /// The conditions describing each Slurm node, keyed by node name.
    pub node_states: BTreeMap<String, Vec<PodCondition>>,
}

impl SlurmNodeStatus {
    fn counter(&mut self, state: NodeState) -> Option<&mut i32> {
        Some(match state {
            NodeState::Allocated => &mut self.allocated,
            NodeState::Down => &mut self.down,
            NodeState::Error => &mut self.error,
            NodeState::Future => &mut self.future,
            NodeState::Idle => &mut self.idle,
            NodeState::Mixed => &mut self.mixed,
            NodeState::Unknown => &mut self.unknown,
            NodeState::Completing => &mut self.completing,
            NodeState::Drain => &mut self.drain,
            NodeState::Fail => &mut self.fail,
            NodeState::Invalid => &mut self.invalid,
            NodeState::InvalidReg => &mut self.invalid_reg,
            NodeState::Maintenance => &mut self.maintenance,
            NodeState::NotResponding => &mut self.not_responding,
            NodeState::Undrain => &mut self.undrain,
            NodeState::Other => return None,
        })
    }
}

/// Aggregate the given Slurm nodes, counting only those named in `hostnames`.
///
/// Each node counts toward exactly one base state, by precedence, and toward every flag it has.
pub fn aggregate(slurm_nodes: &[SlurmNode], hostnames: &BTreeSet<&str>, now: DateTime<Utc>) -> SlurmNodeStatus {
    let mut status = SlurmNodeStatus::default();
    for node in slurm_nodes.iter().filter(|node| hostnames.contains(node.name.as_str())) {
        status.total += 1;
        for state in node.tracked_states() {
            if let Some(counter) = status.counter(state) {
                *counter += 1;
            }
        }
        status.node_states.insert(node.name.clone(), conditions::node_conditions(node, now));
    }
    status
}

/// Compute the Slurm state conditions to patch onto the given pod, if any changed.
///
/// States which are present become `True`; states the pod carried as `True` but which are
/// now absent become `False`. Returns `None` when the pod already reflects the given states.
pub fn condition_patch(pod: &Pod, desired: &[PodCondition], now: DateTime<Utc>) -> Option<Vec<PodCondition>> {
    let current: Vec<&PodCondition> = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .into_iter()
        .flatten()
        .filter(|cond| cond.type_.starts_with(STATE_PREFIX))
        .collect();

    let mut patch = Vec::new();
    for cond in desired {
        let unchanged = current
            .iter()
            .any(|cur| cur.type_ == cond.type_ && cur.status == cond.status && cur.message == cond.message);
        if !unchanged {
            patch.push(cond.clone());
        }
    }
    for cur in current.iter().filter(|cur| cur.status == "True") {
        if desired.iter().any(|cond| cond.type_ == cur.type_) {
            continue;
        }
        patch.push(PodCondition {
            type_: cur.type_.clone(),
            status: "False".into(),
            message: None,
            reason: None,
            last_probe_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
        });
    }
    (!patch.is_empty()).then_some(patch)
}
