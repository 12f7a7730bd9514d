//! Slurm REST data model.
//!
//! Only the subset of the slurmrestd `v0.0.44` schema which the operator reads or writes.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The slurmrestd API version spoken by the operator.
pub const SLURM_API_VERSION: &str = "v0.0.44";

/// A Slurm node state.
///
/// Base states are mutually exclusive; flag states may be combined with any base state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    // Base states.
    Allocated,
    Down,
    Error,
    Future,
    Idle,
    Mixed,
    Unknown,
    // Flag states.
    Completing,
    Drain,
    Fail,
    Invalid,
    InvalidReg,
    Maintenance,
    NotResponding,
    Undrain,
    /// Any state not tracked by the operator, e.g. `CLOUD` or `POWERED_DOWN`.
    #[serde(other)]
    Other,
}

impl NodeState {
    /// The base states, in order of precedence.
    pub const BASE: [NodeState; 7] = [
        Self::Allocated,
        Self::Down,
        Self::Error,
        Self::Future,
        Self::Idle,
        Self::Mixed,
        Self::Unknown,
    ];

    /// The flag states.
    pub const FLAGS: [NodeState; 8] = [
        Self::Completing,
        Self::Drain,
        Self::Fail,
        Self::Invalid,
        Self::InvalidReg,
        Self::Maintenance,
        Self::NotResponding,
        Self::Undrain,
    ];
}

/// The set of states of a Slurm node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct NodeStateSet(pub BTreeSet<NodeState>);

impl NodeStateSet {
    pub fn has(&self, state: NodeState) -> bool {
        self.0.contains(&state)
    }

    pub fn has_any(&self, states: &[NodeState]) -> bool {
        states.iter().any(|state| self.0.contains(state))
    }

    pub fn has_all(&self, states: &[NodeState]) -> bool {
        states.iter().all(|state| self.0.contains(state))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeState> {
        self.0.iter()
    }
}

impl FromIterator<NodeState> for NodeStateSet {
    fn from_iter<T: IntoIterator<Item = NodeState>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A Slurm node.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SlurmNode {
    pub name: String,
    #[serde(default)]
    pub state: NodeStateSet,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub comment: String,
}

impl SlurmNode {
    /// A node is busy while it is running work, including job prolog & epilog.
    pub fn is_busy(&self) -> bool {
        self.state.has_any(&[NodeState::Allocated, NodeState::Mixed, NodeState::Completing])
    }

    /// A node is drain when it has DRAIN and not UNDRAIN.
    pub fn is_drain(&self) -> bool {
        self.state.has(NodeState::Drain) && !self.state.has(NodeState::Undrain)
    }

    /// A node is drained when it is drain and no longer busy.
    pub fn is_drained(&self) -> bool {
        self.is_drain() && !self.is_busy()
    }

    /// The tracked states of this node: its first base state by precedence, then its flags.
    pub fn tracked_states(&self) -> Vec<NodeState> {
        let base = NodeState::BASE.into_iter().find(|state| self.state.has(*state));
        base.into_iter()
            .chain(NodeState::FLAGS.into_iter().filter(|state| self.state.has(*state)))
            .collect()
    }

    /// Slurm marks nodes which stop answering pings as DOWN, appending `Not responding` to the reason.
    pub fn is_down_for_unresponsive(&self) -> bool {
        self.state.has(NodeState::Down) && self.reason.contains("Not responding")
    }
}

/// A Slurm job state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    #[serde(other)]
    Other,
}

/// An optionally set, possibly infinite, number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NoValNumber {
    #[serde(default)]
    pub set: bool,
    #[serde(default)]
    pub infinite: bool,
    #[serde(default)]
    pub number: i64,
}

impl NoValNumber {
    /// The value, if it is set and finite.
    pub fn value(&self) -> Option<i64> {
        (self.set && !self.infinite).then_some(self.number)
    }
}

/// A Slurm job.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SlurmJob {
    pub job_id: i64,
    #[serde(default)]
    pub job_state: Vec<JobState>,
    /// The hostlist expression of the nodes allocated to this job.
    #[serde(default)]
    pub nodes: String,
    #[serde(default)]
    pub start_time: NoValNumber,
    /// The time limit, in minutes.
    #[serde(default)]
    pub time_limit: NoValNumber,
}

impl SlurmJob {
    pub fn is_running(&self) -> bool {
        self.job_state.contains(&JobState::Running)
    }

    /// The time by which this job will have ended.
    ///
    /// A job with no start time or no finite time limit ends at `DateTime::<Utc>::MAX_UTC`.
    pub fn deadline(&self) -> DateTime<Utc> {
        let (start, limit) = match (self.start_time.value(), self.time_limit.value()) {
            (Some(start), Some(limit)) => (start, limit),
            _ => return DateTime::<Utc>::MAX_UTC,
        };
        DateTime::from_timestamp(start, 0)
            .and_then(|start| start.checked_add_signed(Duration::minutes(limit)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A request to update a Slurm node. Unset fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct UpdateNodeMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Vec<NodeState>>,
}

/// An error or warning entry of a slurmrestd response.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_number: i64,
}

/// The body of node responses.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodesResponse {
    #[serde(default)]
    pub nodes: Vec<SlurmNode>,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
}

/// The body of job responses.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JobsResponse {
    #[serde(default)]
    pub jobs: Vec<SlurmJob>,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
}

/// The body of responses which carry no data.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EmptyResponse {
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;

    #[test]
    fn node_state_set_decodes_unknown_states() -> Result<()> {
        let node: SlurmNode = serde_json::from_str(
            r#"{"name":"gpu-0","state":["IDLE","DRAIN","POWERED_DOWN","NOT_RESPONDING"],"reason":"","comment":""}"#,
        )?;
        assert!(node.state.has(NodeState::Idle), "expected IDLE in {:?}", node.state);
        assert!(node.state.has(NodeState::Drain), "expected DRAIN in {:?}", node.state);
        assert!(node.state.has(NodeState::NotResponding), "expected NOT_RESPONDING in {:?}", node.state);
        assert!(node.state.has(NodeState::Other), "expected unknown state to decode as Other");
        assert!(node.state.has_all(&[NodeState::Idle, NodeState::Drain]), "expected has_all to hold");
        assert!(!node.state.has_any(&[NodeState::Allocated, NodeState::Mixed]), "expected has_any to fail");
        Ok(())
    }

    #[test]
    fn tracked_states_keep_one_base_state() {
        let node = SlurmNode {
            name: "gpu-0".into(),
            state: [NodeState::Idle, NodeState::Allocated, NodeState::Drain, NodeState::Other].into_iter().collect(),
            ..Default::default()
        };
        let states = node.tracked_states();
        assert!(
            states == vec![NodeState::Allocated, NodeState::Drain],
            "expected ALLOCATED to take precedence, got {:?}",
            states
        );
    }

    #[test]
    fn node_drain_predicates() {
        let mut node = SlurmNode {
            name: "gpu-0".into(),
            state: [NodeState::Mixed, NodeState::Drain].into_iter().collect(),
            ..Default::default()
        };
        assert!(node.is_drain(), "expected drain");
        assert!(!node.is_drained(), "expected busy node to not be drained");

        node.state = [NodeState::Idle, NodeState::Drain].into_iter().collect();
        assert!(node.is_drained(), "expected idle drain node to be drained");

        node.state = [NodeState::Idle, NodeState::Drain, NodeState::Undrain].into_iter().collect();
        assert!(!node.is_drain(), "expected undrain to cancel drain");
    }

    #[test]
    fn unresponsive_requires_down_and_reason() {
        let mut node = SlurmNode {
            name: "gpu-0".into(),
            state: [NodeState::Down].into_iter().collect(),
            reason: "Not responding".into(),
            ..Default::default()
        };
        assert!(node.is_down_for_unresponsive(), "expected node to be down for unresponsive");

        node.reason = "maintenance".into();
        assert!(!node.is_down_for_unresponsive(), "expected other reasons to not count");
    }

    #[test]
    fn job_deadline_is_start_plus_limit() {
        let job = SlurmJob {
            job_id: 1,
            job_state: vec![JobState::Running],
            nodes: "gpu-0".into(),
            start_time: NoValNumber { set: true, infinite: false, number: 1_000 },
            time_limit: NoValNumber { set: true, infinite: false, number: 2 },
        };
        let deadline = job.deadline();
        assert!(deadline.timestamp() == 1_120, "expected deadline 1120, got {}", deadline.timestamp());

        let job = SlurmJob {
            time_limit: NoValNumber { set: true, infinite: true, number: 0 },
            ..job
        };
        assert!(job.deadline() == DateTime::<Utc>::MAX_UTC, "expected infinite deadline");
    }

    #[test]
    fn update_msg_skips_unset_fields() -> Result<()> {
        let msg = UpdateNodeMsg {
            state: Some(vec![NodeState::Drain]),
            reason: Some("slurm-operator: Pod is being deleted".into()),
            ..Default::default()
        };
        let body = serde_json::to_string(&msg)?;
        assert!(
            body == r#"{"reason":"slurm-operator: Pod is being deleted","state":["DRAIN"]}"#,
            "unexpected body {}",
            body
        );
        Ok(())
    }
}
