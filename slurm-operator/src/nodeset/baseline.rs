//! Baseline pod management: one pod per desired node.
//!
//! The baseline owns pod creation and the resolution of excess pods. Pods it wants gone are
//! condemned rather than deleted, so that they flow through the same drain path as pods
//! condemned by the rolling update.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use super::NodeSetReconciler;
use crate::nodeset::pods;
use crate::nodeset::utils::{
    is_pod_available, is_pod_finished, is_pod_live, is_pod_marked_for_deletion, is_pod_updated, matching_nodes, PodsByNode,
};
use slurm_core::crd::{NodeSet, RequiredMetadata};

/// The changes needed to bring a NodeSet's pods to its baseline.
#[derive(Debug, Default)]
pub struct BaselinePlan<'a> {
    /// The nodes which should each run one pod.
    pub desired_nodes: BTreeSet<String>,
    /// Desired nodes which have no pod at all.
    pub create_on: Vec<String>,
    /// Live pods which should be condemned.
    pub condemn: Vec<&'a Pod>,
    /// Finished pods, which are deleted directly.
    pub delete_finished: Vec<&'a Pod>,
}

/// The nodes which should run a pod of the given NodeSet, in weight order.
///
/// With explicit replicas, nodes already hosting a live pod are preferred so that scaling
/// does not shuffle pods between nodes.
pub fn desired_nodes<'a>(nodeset: &NodeSet, nodes: &'a [Node], pods_by_node: &PodsByNode) -> Vec<&'a Node> {
    let matching = matching_nodes(nodeset, nodes);
    let replicas = match nodeset.spec.replicas {
        Some(replicas) => replicas.max(0) as usize,
        None => return matching,
    };
    let (hosting, rest): (Vec<&Node>, Vec<&Node>) = matching.into_iter().partition(|node| {
        pods_by_node
            .get(node.name())
            .map(|pods| pods.iter().any(is_pod_live))
            .unwrap_or(false)
    });
    hosting.into_iter().chain(rest).take(replicas).collect()
}

/// Order pods by preference for retention: updated, then available, then oldest.
fn retention_order(nodeset: &NodeSet, hash: &str, now: DateTime<Utc>, a: &Pod, b: &Pod) -> Ordering {
    let min_ready = nodeset.min_ready();
    let rank = |pod: &Pod| (!is_pod_updated(nodeset, pod, hash), !is_pod_available(pod, min_ready, now));
    rank(a)
        .cmp(&rank(b))
        .then_with(|| {
            let created = |pod: &Pod| pod.metadata.creation_timestamp.as_ref().map(|time| time.0);
            match (created(a), created(b)) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
        .then_with(|| a.name().cmp(b.name()))
}

/// Plan the baseline of the given NodeSet.
pub fn compute_baseline<'a>(
    nodeset: &NodeSet, nodes: &[Node], pods_by_node: &'a PodsByNode, hash: &str, now: DateTime<Utc>,
) -> BaselinePlan<'a> {
    let mut plan = BaselinePlan {
        desired_nodes: desired_nodes(nodeset, nodes, pods_by_node)
            .into_iter()
            .map(|node| node.name().to_string())
            .collect(),
        ..Default::default()
    };

    for name in plan.desired_nodes.iter() {
        if pods_by_node.get(name).map(Vec::is_empty).unwrap_or(true) {
            plan.create_on.push(name.clone());
        }
    }

    for (name, pods) in pods_by_node.iter() {
        plan.delete_finished.extend(pods.iter().filter(|pod| is_pod_finished(pod)));
        let mut live: Vec<&Pod> = pods.iter().filter(|pod| is_pod_live(pod)).collect();
        if !plan.desired_nodes.contains(name) {
            plan.condemn.extend(live.into_iter().filter(|pod| !is_pod_marked_for_deletion(pod)));
            continue;
        }
        if live.len() > 1 {
            live.sort_by(|a, b| retention_order(nodeset, hash, now, a, b));
            plan.condemn.extend(live.into_iter().skip(1).filter(|pod| !is_pod_marked_for_deletion(pod)));
        }
    }
    plan
}

impl NodeSetReconciler {
    /// Bring the NodeSet's pods to the baseline, updating `pods_by_node` with the outcome.
    ///
    /// Desired nodes without pods get an empty entry in `pods_by_node`.
    #[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
    pub(super) async fn sync_baseline(
        &self, nodeset: &NodeSet, nodes: &[Node], pods_by_node: &mut PodsByNode, hash: &str, now: DateTime<Utc>,
    ) -> Result<()> {
        let BaselinePlan {
            desired_nodes,
            create_on,
            condemn,
            delete_finished,
        } = compute_baseline(nodeset, nodes, pods_by_node, hash, now);
        let condemn: Vec<Pod> = condemn.into_iter().cloned().collect();
        let finished: Vec<Pod> = delete_finished.into_iter().cloned().collect();

        for pod in finished.iter() {
            tracing::info!(pod = %pod.key(), "deleting finished pod");
            self.kube
                .delete_pod(pod.namespace(), pod.name())
                .await
                .with_context(|| format!("error deleting finished pod {}", pod.key()))?;
            if let Some(node_pods) = pods_by_node.values_mut().find(|pods| pods.iter().any(|cur| cur.key() == pod.key())) {
                node_pods.retain(|cur| cur.key() != pod.key());
            }
        }

        for node in create_on.iter() {
            let pod = pods::new_pod(nodeset, node, hash)?;
            tracing::info!(pod = %pod.key(), node = %node, "creating pod");
            self.kube
                .create_pod(&pod)
                .await
                .with_context(|| format!("error creating pod {}", pod.key()))?;
            metrics::counter!(super::METRIC_PODS_CREATED).increment(1);
        }

        self.condemn_pods(pods_by_node, &condemn).await?;

        for node in desired_nodes {
            pods_by_node.entry(node).or_default();
        }
        Ok(())
    }
}
