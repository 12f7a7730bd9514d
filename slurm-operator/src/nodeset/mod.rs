//! NodeSet reconciliation.
//!
//! A pass over a NodeSet runs these stages in order:
//! - baseline: create missing pods and condemn excess ones;
//! - rolling update: condemn old pods within the unavailable budget;
//! - condemned pods: drain their Slurm nodes & delete the pods once drained;
//! - undrain: resume Slurm nodes of healthy pods which the operator drained;
//! - external state: reconcile Slurm node identities against the pods;
//! - status: recompute & persist the NodeSet status.

mod baseline;
pub mod node_status;
pub mod pods;
mod rolling;
mod slurmcontrol;
#[cfg(test)]
mod slurmcontrol_test;
mod status;
mod sync;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::k8s::KubeOps;
use crate::nodeset::utils::{
    is_pod_healthy, is_pod_live, is_pod_marked_for_deletion, is_pod_running, pod_hostname, pod_node_name, template_hash, PodsByNode,
};
use crate::resync::ResyncScheduler;
use slurm_core::crd::{NodeSet, NodeSetUpdateStrategyType, RequiredMetadata};
use slurm_core::ANNOTATION_POD_DELETE;

pub use baseline::{compute_baseline, desired_nodes, BaselinePlan};
pub use rolling::compute_rolling_update;
pub use slurmcontrol::{prefixed_reason, SlurmControl};
pub use status::calculate_status;

/// The reason set on Slurm nodes drained because their pod is being deleted.
pub const REASON_POD_DELETE: &str = "Pod is being deleted";
/// The reason set on Slurm nodes undrained because their pod is healthy.
pub const REASON_POD_HEALTHY: &str = "Pod is healthy";

/// The longest a condemned pod waits before its Slurm node is checked again.
const DRAIN_RESYNC_MAX: Duration = Duration::from_secs(30);
/// The shortest a condemned pod waits before its Slurm node is checked again.
const DRAIN_RESYNC_MIN: Duration = Duration::from_secs(1);

const METRIC_PODS_CREATED: &str = "slurm_operator_pods_created_total";
const METRIC_PODS_CONDEMNED: &str = "slurm_operator_pods_condemned_total";
const METRIC_PODS_DELETED: &str = "slurm_operator_pods_deleted_total";

/// The duration to wait before checking on a draining node again, given the deadline of the
/// last job running on it.
pub fn drain_resync_after(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match deadline {
        None => DRAIN_RESYNC_MAX,
        Some(deadline) => (deadline - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .clamp(DRAIN_RESYNC_MIN, DRAIN_RESYNC_MAX),
    }
}

/// Reconciles NodeSets against Kubernetes & Slurm.
pub struct NodeSetReconciler {
    kube: Arc<dyn KubeOps>,
    slurm: SlurmControl,
    resync: Arc<dyn ResyncScheduler>,
}

impl NodeSetReconciler {
    pub fn new(kube: Arc<dyn KubeOps>, slurm: SlurmControl, resync: Arc<dyn ResyncScheduler>) -> Self {
        Self { kube, slurm, resync }
    }

    /// Run a full reconciliation pass over the given NodeSet.
    ///
    /// The status is recomputed even when an earlier stage fails.
    #[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
    pub async fn sync(&self, nodeset: &NodeSet, now: DateTime<Utc>) -> Result<()> {
        let hash = template_hash(nodeset)?;
        let nodes = self.kube.list_nodes().await.context("error listing nodes")?;
        let pods = self
            .kube
            .list_pods(nodeset.namespace(), &pods::selector(nodeset))
            .await
            .with_context(|| format!("error listing pods of nodeset {}", nodeset.key()))?;

        let mut pods_by_node = PodsByNode::new();
        for pod in pods.into_iter().filter(|pod| pods::is_owned_by(pod, nodeset)) {
            match pod_node_name(&pod) {
                Some(node) => pods_by_node.entry(node.to_string()).or_default().push(pod),
                None => tracing::debug!(pod = %pod.key(), "skipping pod which is not bound to a node"),
            }
        }

        let res = self.sync_pods(nodeset, &nodes, &mut pods_by_node, &hash, now).await;
        let status_res = self.sync_status(nodeset, &nodes, &pods_by_node, &hash, now).await;
        res.and(status_res)
    }

    async fn sync_pods(&self, nodeset: &NodeSet, nodes: &[Node], pods_by_node: &mut PodsByNode, hash: &str, now: DateTime<Utc>) -> Result<()> {
        self.slurm.refresh_node_cache(nodeset).await?;
        self.sync_baseline(nodeset, nodes, pods_by_node, hash, now).await?;
        match nodeset.spec.update_strategy.type_ {
            NodeSetUpdateStrategyType::RollingUpdate => self.sync_rolling_update(nodeset, nodes, pods_by_node, hash, now).await?,
            NodeSetUpdateStrategyType::OnDelete => tracing::trace!("update strategy is OnDelete, skipping rolling update"),
        }
        self.process_condemned(nodeset, pods_by_node, now).await?;
        self.undrain_healthy(nodeset, pods_by_node).await?;
        self.sync_external_state(nodeset, nodes, pods_by_node, now).await?;
        Ok(())
    }

    /// Condemn the pods picked by the rolling update.
    async fn sync_rolling_update(&self, nodeset: &NodeSet, nodes: &[Node], pods_by_node: &mut PodsByNode, hash: &str, now: DateTime<Utc>) -> Result<()> {
        let condemn: Vec<Pod> = compute_rolling_update(nodeset, nodes, pods_by_node, hash, now)?
            .into_iter()
            .filter(|pod| !is_pod_marked_for_deletion(pod))
            .cloned()
            .collect();
        self.condemn_pods(pods_by_node, &condemn).await
    }

    /// Mark the given pods for deletion, keeping `pods_by_node` in line with the results.
    async fn condemn_pods(&self, pods_by_node: &mut PodsByNode, targets: &[Pod]) -> Result<()> {
        for target in targets {
            let updated = self.condemn_pod(target).await?;
            let pods = match pod_node_name(target).and_then(|node| pods_by_node.get_mut(node)) {
                Some(pods) => pods,
                None => continue,
            };
            match updated {
                Some(updated) => {
                    if let Some(cur) = pods.iter_mut().find(|cur| cur.key() == updated.key()) {
                        *cur = updated;
                    }
                }
                None => pods.retain(|cur| cur.key() != target.key()),
            }
        }
        Ok(())
    }

    /// Mark a pod for deletion, returning its latest state or `None` if it no longer exists.
    async fn condemn_pod(&self, pod: &Pod) -> Result<Option<Pod>> {
        let mut current = match self
            .kube
            .get_pod(pod.namespace(), pod.name())
            .await
            .with_context(|| format!("error fetching pod {}", pod.key()))?
        {
            Some(current) => current,
            None => return Ok(None),
        };
        if is_pod_marked_for_deletion(&current) {
            return Ok(Some(current));
        }

        tracing::info!(pod = %pod.key(), "marking pod for deletion");
        current
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_POD_DELETE.into(), "true".into());
        let updated = self
            .kube
            .replace_pod(&current)
            .await
            .with_context(|| format!("error marking pod {} for deletion", pod.key()))?;
        metrics::counter!(METRIC_PODS_CONDEMNED).increment(1);
        Ok(Some(updated))
    }

    /// Drain the Slurm nodes of condemned pods, deleting each pod once its node is drained.
    ///
    /// Pods whose nodes are still running jobs are checked again later.
    #[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
    async fn process_condemned(&self, nodeset: &NodeSet, pods_by_node: &PodsByNode, now: DateTime<Utc>) -> Result<()> {
        let condemned: Vec<&Pod> = pods_by_node
            .values()
            .flatten()
            .filter(|pod| is_pod_live(pod) && is_pod_marked_for_deletion(pod))
            .collect();
        if condemned.is_empty() {
            return Ok(());
        }

        let mut deadlines = None;
        for pod in condemned.iter() {
            self.slurm.make_node_drain(nodeset, pod, REASON_POD_DELETE).await?;
            let ready = !is_pod_running(pod)
                || self.slurm.is_node_drained(nodeset, pod).await?
                || self.slurm.is_node_down_for_unresponsive(nodeset, pod).await?;
            if ready {
                tracing::info!(pod = %pod.key(), "deleting condemned pod");
                self.kube
                    .delete_pod(pod.namespace(), pod.name())
                    .await
                    .with_context(|| format!("error deleting pod {}", pod.key()))?;
                metrics::counter!(METRIC_PODS_DELETED).increment(1);
                continue;
            }

            if deadlines.is_none() {
                deadlines = Some(self.slurm.get_node_deadlines(nodeset, &condemned).await?);
            }
            let deadline = deadlines.as_ref().and_then(|deadlines| deadlines.get(pod_hostname(pod)));
            let after = drain_resync_after(deadline, now);
            tracing::debug!(pod = %pod.key(), ?after, "slurm node is still draining");
            self.resync.push(&nodeset.key(), after);
        }
        Ok(())
    }

    /// Undrain the Slurm nodes of healthy pods which the operator drained.
    #[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
    async fn undrain_healthy(&self, nodeset: &NodeSet, pods_by_node: &PodsByNode) -> Result<()> {
        if !self.slurm.has_client(nodeset) {
            return Ok(());
        }
        let healthy = pods_by_node
            .values()
            .flatten()
            .filter(|pod| is_pod_healthy(pod) && !is_pod_marked_for_deletion(pod));
        for pod in healthy {
            if self.slurm.is_node_drain(nodeset, pod).await? && self.slurm.is_node_reason_ours(nodeset, pod).await? {
                self.slurm.make_node_undrain(nodeset, pod, REASON_POD_HEALTHY).await?;
            }
        }
        Ok(())
    }
}
