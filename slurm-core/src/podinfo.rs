//! The pod identity record stored in a Slurm node's comment.
//!
//! The record links a Slurm node back to the pod which runs it, and to the Kubernetes node
//! that pod was scheduled to. It is stored as `slurm-operator:podinfo <json>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The prefix of a serialized pod identity record.
pub const PODINFO_PREFIX: &str = "slurm-operator:podinfo";

/// Errors from parsing a pod identity record.
#[derive(Debug, Error)]
pub enum PodInfoError {
    #[error("missing slurm-operator:podinfo prefix")]
    MissingPrefix,
    #[error("invalid podinfo body: {0}")]
    Body(#[from] serde_json::Error),
}

/// The identity of the pod running a Slurm node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub namespace: String,
    pub pod_name: String,
    /// The Kubernetes node the pod is bound to.
    pub node: String,
}

impl PodInfo {
    /// Parse a record, treating any malformed or absent record as empty.
    pub fn parse_or_default(comment: &str) -> Self {
        comment.parse().unwrap_or_default()
    }

    /// Check if this record identifies no pod at all.
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.pod_name.is_empty()
    }
}

impl fmt::Display for PodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{} {}", PODINFO_PREFIX, body)
    }
}

impl FromStr for PodInfo {
    type Err = PodInfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim().strip_prefix(PODINFO_PREFIX).ok_or(PodInfoError::MissingPrefix)?;
        Ok(serde_json::from_str(body.trim())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn podinfo_round_trip() -> anyhow::Result<()> {
        let info = PodInfo {
            namespace: "hpc".into(),
            pod_name: "gpu-node-a".into(),
            node: "node-a".into(),
        };
        let encoded = info.to_string();
        assert!(
            encoded == r#"slurm-operator:podinfo {"namespace":"hpc","podName":"gpu-node-a","node":"node-a"}"#,
            "unexpected encoding {}",
            encoded
        );
        let decoded: PodInfo = encoded.parse()?;
        assert!(decoded == info, "expected {:?}, got {:?}", info, decoded);
        Ok(())
    }

    #[test]
    fn podinfo_parse_is_strict() {
        assert!(
            matches!("".parse::<PodInfo>(), Err(PodInfoError::MissingPrefix)),
            "expected empty comment to be rejected"
        );
        assert!(
            matches!("admin note".parse::<PodInfo>(), Err(PodInfoError::MissingPrefix)),
            "expected free text to be rejected"
        );
        assert!(
            matches!("slurm-operator:podinfo {".parse::<PodInfo>(), Err(PodInfoError::Body(_))),
            "expected a broken body to be rejected"
        );
    }

    #[test]
    fn podinfo_parse_or_default_degrades() {
        let info = PodInfo::parse_or_default("not a record");
        assert!(info.is_empty(), "expected an empty record, got {:?}", info);
    }
}
