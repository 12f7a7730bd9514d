//! Reconciliation of Slurm node identities against the NodeSet's pods.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use super::NodeSetReconciler;
use crate::nodeset::utils::{is_pod_available, is_pod_healthy, is_pod_live, is_pod_marked_for_deletion, pod_hostname, pod_node_name, PodsByNode};
use slurm_core::crd::{NodeSet, RequiredMetadata};
use slurm_core::podinfo::PodInfo;
use slurm_core::slurm::{NodeState, SlurmNode};

/// How long a healthy pod may run without a Slurm node before it is condemned.
pub const SLURM_NODE_GRACE: Duration = Duration::from_secs(30);

impl NodeSetReconciler {
    /// Push pod identities into Slurm, delete orphaned Slurm nodes & condemn pods whose
    /// Slurm node has gone missing.
    #[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
    pub(super) async fn sync_external_state(&self, nodeset: &NodeSet, nodes: &[Node], pods_by_node: &PodsByNode, now: DateTime<Utc>) -> Result<()> {
        if !self.slurm.has_client(nodeset) {
            tracing::trace!("no slurm client registered, skipping external state sync");
            return Ok(());
        }

        let live_nodes: BTreeSet<&str> = nodes
            .iter()
            .filter(|node| node.metadata.deletion_timestamp.is_none())
            .map(|node| node.name())
            .collect();
        let pods: Vec<&Pod> = pods_by_node.values().flatten().collect();
        for pod in pods.iter().filter(|pod| is_pod_healthy(pod)) {
            if !pod_node_name(pod).map(|node| live_nodes.contains(node)).unwrap_or(false) {
                continue;
            }
            self.slurm.update_node_with_pod_info(nodeset, pod).await?;
        }

        let known: BTreeSet<&str> = pods.iter().filter(|pod| is_pod_live(pod)).map(|pod| pod_hostname(pod)).collect();
        let slurm_nodes = self.slurm.list_nodes(nodeset).await?;
        let mut retained = BTreeSet::new();
        for node in slurm_nodes.iter() {
            if self.is_orphaned(node, &known).await? {
                self.slurm.delete_node(nodeset, &node.name).await?;
            } else {
                retained.insert(node.name.as_str());
            }
        }

        let missing = pods.iter().filter(|pod| {
            is_pod_healthy(pod)
                && !is_pod_marked_for_deletion(pod)
                && is_pod_available(pod, SLURM_NODE_GRACE, now)
                && !retained.contains(pod_hostname(pod))
        });
        for pod in missing {
            tracing::info!(pod = %pod.key(), "pod has no slurm node, condemning");
            self.condemn_pod(pod).await?;
        }
        Ok(())
    }

    /// Check if the given Slurm node is left over from a pod which no longer exists.
    async fn is_orphaned(&self, node: &SlurmNode, known: &BTreeSet<&str>) -> Result<bool> {
        if !node.state.has_all(&[NodeState::Down, NodeState::NotResponding]) || known.contains(node.name.as_str()) {
            return Ok(false);
        }
        let info = PodInfo::parse_or_default(&node.comment);
        if info.is_empty() {
            return Ok(false);
        }
        let pod = self
            .kube
            .get_pod(&info.namespace, &info.pod_name)
            .await
            .with_context(|| format!("error fetching pod {}/{} of slurm node {}", info.namespace, info.pod_name, node.name))?;
        Ok(pod.is_none())
    }
}
