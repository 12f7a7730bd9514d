//! NodeSet status computation.

use std::cmp::max;
use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use super::NodeSetReconciler;
use crate::nodeset::baseline::desired_nodes;
use crate::nodeset::node_status::{condition_patch, SlurmNodeStatus};
use crate::nodeset::pods;
use crate::nodeset::utils::{
    desired_number_scheduled, is_pod_available, is_pod_live, is_pod_ready, is_pod_updated, pod_hostname, PodsByNode,
};
use slurm_core::crd::{NodeSet, NodeSetStatus, RequiredMetadata};

/// The resync period used while Slurm node states have not settled.
const SLURM_SETTLE_RESYNC: Duration = Duration::from_secs(5);

/// Compute the status of the given NodeSet.
///
/// Each node counts once, judged by its oldest live pod.
pub fn calculate_status(
    nodeset: &NodeSet, nodes: &[Node], pods_by_node: &PodsByNode, hash: &str, slurm: &SlurmNodeStatus, now: DateTime<Utc>,
) -> NodeSetStatus {
    let desired: BTreeSet<&str> = desired_nodes(nodeset, nodes, pods_by_node)
        .into_iter()
        .map(|node| node.name())
        .collect();
    let min_ready = nodeset.min_ready();
    let mut status = NodeSetStatus {
        observed_generation: nodeset.metadata.generation,
        desired_number_scheduled: desired_number_scheduled(nodeset, nodes),
        node_set_hash: Some(hash.to_string()),
        collision_count: nodeset.status.as_ref().and_then(|status| status.collision_count),
        selector: Some(pods::selector(nodeset)),
        ..Default::default()
    };

    for (node, node_pods) in pods_by_node.iter() {
        let pod = node_pods
            .iter()
            .filter(|pod| is_pod_live(pod))
            .min_by_key(|pod| pod.metadata.creation_timestamp.as_ref().map(|time| time.0));
        let pod = match pod {
            Some(pod) => pod,
            None => continue,
        };
        if !desired.contains(node.as_str()) {
            status.number_misscheduled += 1;
            continue;
        }
        status.current_number_scheduled += 1;
        if is_pod_ready(pod) {
            status.number_ready += 1;
        }
        if is_pod_available(pod, min_ready, now) {
            status.number_available += 1;
        }
        if is_pod_updated(nodeset, pod, hash) {
            status.updated_number_scheduled += 1;
        }
    }
    status.number_unavailable = max(0, status.desired_number_scheduled - status.number_available);

    status.number_idle = slurm.idle;
    status.number_allocated = slurm.allocated + slurm.mixed;
    status.number_down = slurm.down;
    status.number_drain = slurm.drain;
    status
}

impl NodeSetReconciler {
    /// Recompute the NodeSet's status, persisting it & the pods' Slurm conditions on change.
    #[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
    pub(super) async fn sync_status(
        &self, nodeset: &NodeSet, nodes: &[Node], pods_by_node: &PodsByNode, hash: &str, now: DateTime<Utc>,
    ) -> Result<()> {
        let live: Vec<&Pod> = pods_by_node.values().flatten().filter(|pod| is_pod_live(pod)).collect();
        let slurm = self.slurm.calculate_node_status(nodeset, &live, now).await?;

        for pod in live.iter() {
            let desired = slurm.node_states.get(pod_hostname(pod)).map(Vec::as_slice).unwrap_or_default();
            if let Some(patch) = condition_patch(pod, desired, now) {
                tracing::debug!(pod = %pod.key(), conditions = patch.len(), "updating slurm node conditions of pod");
                self.kube
                    .patch_pod_conditions(pod.namespace(), pod.name(), &patch)
                    .await
                    .with_context(|| format!("error patching conditions of pod {}", pod.key()))?;
            }
        }

        let status = calculate_status(nodeset, nodes, pods_by_node, hash, &slurm, now);
        if nodeset.status.as_ref() != Some(&status) {
            tracing::debug!(?status, "updating nodeset status");
            self.kube
                .update_nodeset_status(nodeset, &status)
                .await
                .with_context(|| format!("error updating status of nodeset {}", nodeset.key()))?;
        }

        let key = nodeset.key();
        if status.number_ready != status.number_available {
            self.resync.push(&key, max(nodeset.min_ready(), Duration::from_secs(1)));
        } else if self.slurm.has_client(nodeset) && status.number_idle + status.number_allocated != status.desired_number_scheduled {
            self.resync.push(&key, SLURM_SETTLE_RESYNC);
        }
        Ok(())
    }
}
