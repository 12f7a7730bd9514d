//! Rolling update planning.
//!
//! The plan is pure: it inspects the current pods of a NodeSet and answers which of them
//! should be condemned next, within the `maxUnavailable` budget and outside of the frozen
//! partition.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::nodeset::utils::{
    desired_number_scheduled, find_updated_pods_on_node, is_pod_available, is_pod_live, is_pod_marked_for_deletion, max_unavailable,
    node_should_run_pod, sort_nodes_by_weight, PodsByNode,
};
use slurm_core::crd::{NodeSet, RequiredMetadata};

/// Compute the pods which should be deleted to advance the rolling update.
///
/// Old pods which are unavailable or already marked for deletion are always returned. Old
/// available pods are returned in weight order while the unavailable budget allows.
#[tracing::instrument(level = "debug", skip_all, fields(nodeset = %nodeset.key()))]
pub fn compute_rolling_update<'a>(
    nodeset: &NodeSet, nodes: &[Node], pods_by_node: &'a PodsByNode, hash: &str, now: DateTime<Utc>,
) -> Result<Vec<&'a Pod>> {
    let desired = desired_number_scheduled(nodeset, nodes);
    let max_unavailable = max_unavailable(nodeset, desired)?;
    let min_ready = nodeset.min_ready();
    let existing: BTreeMap<&str, &Node> = nodes.iter().map(|node| (node.name(), node)).collect();

    // Nodes which should be running a pod but have none count against the budget.
    let mut num_unavailable = 0;
    let mut candidates = Vec::with_capacity(pods_by_node.len());
    for (name, pods) in pods_by_node.iter() {
        let node = match existing.get(name.as_str()) {
            Some(node) => *node,
            None => continue,
        };
        if pods.iter().any(is_pod_live) {
            candidates.push(node);
        } else if node_should_run_pod(node, nodeset) {
            num_unavailable += 1;
        }
    }
    sort_nodes_by_weight(&mut candidates);

    let partition = nodeset.partition();
    let mut must_replace = vec![];
    let mut optional = vec![];
    for node in candidates.iter().skip(partition) {
        let pods = match pods_by_node.get(node.name()) {
            Some(pods) => pods,
            None => continue,
        };
        match find_updated_pods_on_node(nodeset, pods, hash) {
            None => {
                tracing::debug!(node = node.name(), "node has excess pods, excluding from rolling update");
                num_unavailable += 1;
            }
            Some((Some(_), Some(_))) | Some((None, None)) => num_unavailable += 1,
            Some((Some(new_pod), None)) => {
                if !is_pod_available(new_pod, min_ready, now) {
                    num_unavailable += 1;
                }
            }
            Some((None, Some(old_pod))) => {
                if !is_pod_available(old_pod, min_ready, now) || is_pod_marked_for_deletion(old_pod) {
                    must_replace.push(old_pod);
                    num_unavailable += 1;
                } else {
                    optional.push(old_pod);
                }
            }
        }
    }

    let budget = (max_unavailable - num_unavailable).max(0) as usize;
    tracing::debug!(
        desired,
        max_unavailable,
        num_unavailable,
        must_replace = must_replace.len(),
        optional = optional.len(),
        "computed rolling update"
    );
    must_replace.extend(optional.into_iter().take(budget));
    Ok(must_replace)
}
