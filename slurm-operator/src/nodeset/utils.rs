//! Node & pod predicates shared by the NodeSet engines.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use slurm_core::crd::{NodeSet, RequiredMetadata};
use slurm_core::{ANNOTATION_NODE_WEIGHT, ANNOTATION_POD_DELETE, LABEL_TEMPLATE_GENERATION, LABEL_TEMPLATE_HASH};

/// A NodeSet's pods, keyed by the name of the Kubernetes node they are bound to.
///
/// Built fresh on every pass. Desired nodes without pods map to an empty list.
pub type PodsByNode = BTreeMap<String, Vec<Pod>>;

//////////////////////////////////////////////////////////////////////////////
// Nodes /////////////////////////////////////////////////////////////////////

/// The weight of the given node, where lower weights rank first.
///
/// A missing or malformed weight annotation counts as 0.
pub fn node_weight(node: &Node) -> i32 {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_NODE_WEIGHT))
        .and_then(|val| val.trim().parse::<i32>().ok())
        .unwrap_or(0)
}

/// Stable sort the given nodes by weight, breaking ties by name.
pub fn sort_nodes_by_weight(nodes: &mut [&Node]) {
    nodes.sort_by(|a, b| node_weight(a).cmp(&node_weight(b)).then_with(|| a.name().cmp(b.name())));
}

/// Check if the given NodeSet should run a pod on the given node.
///
/// The node must carry every label of the template's node selector, every NoSchedule &
/// NoExecute taint of the node must be tolerated, and the node must not be going away.
pub fn node_should_run_pod(node: &Node, nodeset: &NodeSet) -> bool {
    if node.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let pod_spec = match nodeset.spec.template.spec.as_ref() {
        Some(pod_spec) => pod_spec,
        None => return false,
    };

    let labels = node.metadata.labels.clone().unwrap_or_default();
    let selector_matches = pod_spec
        .node_selector
        .iter()
        .flatten()
        .all(|(key, val)| labels.get(key) == Some(val));
    if !selector_matches {
        return false;
    }

    let tolerations = pod_spec.tolerations.as_deref().unwrap_or_default();
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .into_iter()
        .flatten()
        .filter(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
        .all(|taint| tolerations.iter().any(|toleration| tolerates(toleration, taint)))
}

/// Check if the given toleration tolerates the given taint.
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    let effect = toleration.effect.as_deref().unwrap_or_default();
    if !effect.is_empty() && effect != taint.effect {
        return false;
    }
    let key = toleration.key.as_deref().unwrap_or_default();
    if !key.is_empty() && key != taint.key {
        return false;
    }
    match toleration.operator.as_deref().unwrap_or("Equal") {
        "Exists" => true,
        "" | "Equal" => toleration.value.as_deref().unwrap_or_default() == taint.value.as_deref().unwrap_or_default(),
        _ => false,
    }
}

/// The names of the nodes which should run a pod of this NodeSet, sorted by weight & name.
pub fn matching_nodes<'a>(nodeset: &NodeSet, nodes: &'a [Node]) -> Vec<&'a Node> {
    let mut matching: Vec<_> = nodes.iter().filter(|node| node_should_run_pod(node, nodeset)).collect();
    sort_nodes_by_weight(&mut matching);
    matching
}

/// The number of pods this NodeSet should be running.
pub fn desired_number_scheduled(nodeset: &NodeSet, nodes: &[Node]) -> i32 {
    match nodeset.spec.replicas {
        Some(replicas) => replicas.max(0),
        None => nodes.iter().filter(|node| node_should_run_pod(node, nodeset)).count() as i32,
    }
}

/// Resolve the maximum number of unavailable pods for the given desired count.
///
/// Percentages are rounded up. A result of zero with pods desired is forced to 1.
pub fn max_unavailable(nodeset: &NodeSet, desired: i32) -> Result<i32> {
    let spec = nodeset
        .spec
        .update_strategy
        .rolling_update
        .as_ref()
        .and_then(|rolling| rolling.max_unavailable.clone())
        .unwrap_or(IntOrString::Int(1));
    let max = match spec {
        IntOrString::Int(val) => val.max(0),
        IntOrString::String(val) => {
            let percent = match val.trim().strip_suffix('%') {
                Some(percent) => percent
                    .parse::<i64>()
                    .with_context(|| format!("invalid value for maxUnavailable: {:?}", val))?,
                None => bail!("invalid value for maxUnavailable: {:?} is not an integer or a percentage", val),
            };
            let scaled = (percent.max(0) * desired.max(0) as i64 + 99) / 100;
            scaled.min(i32::MAX as i64) as i32
        }
    };
    if desired > 0 && max == 0 {
        tracing::debug!(nodeset = %nodeset.key(), "maxUnavailable resolved to 0, defaulting to 1");
        return Ok(1);
    }
    Ok(max)
}

/// Compute the hash of the NodeSet's pod template.
pub fn template_hash(nodeset: &NodeSet) -> Result<String> {
    let mut bytes = serde_json::to_vec(&nodeset.spec.template).context("error serializing pod template")?;
    if let Some(collision_count) = nodeset.status.as_ref().and_then(|status| status.collision_count) {
        bytes.extend_from_slice(&collision_count.to_le_bytes());
    }
    Ok(format!("{:x}", seahash::hash(&bytes)))
}

//////////////////////////////////////////////////////////////////////////////
// Pods //////////////////////////////////////////////////////////////////////

/// The name of the Kubernetes node the pod is bound to.
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()).filter(|name| !name.is_empty())
}

/// The hostname of the pod, which is also the name of its Slurm node.
pub fn pod_hostname(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.hostname.as_deref())
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| pod.name())
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status.as_ref().and_then(|status| status.phase.as_deref()).unwrap_or_default()
}

pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_pod_failed(pod: &Pod) -> bool {
    pod_phase(pod) == "Failed"
}

/// A pod which ran to completion, successfully or not.
pub fn is_pod_finished(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Failed" | "Succeeded")
}

/// A pod which is neither terminating nor finished.
pub fn is_pod_live(pod: &Pod) -> bool {
    !is_pod_terminating(pod) && !is_pod_finished(pod)
}

pub fn is_pod_running(pod: &Pod) -> bool {
    pod_phase(pod) == "Running"
}

/// The time since which the pod has been ready, if it is ready.
pub fn pod_ready_since(pod: &Pod) -> Option<Option<DateTime<Utc>>> {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|cond| cond.type_ == "Ready" && cond.status == "True"))
        .map(|cond| cond.last_transition_time.as_ref().map(|time| time.0))
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod_ready_since(pod).is_some()
}

/// A pod is available when it has been ready for at least `min_ready`.
pub fn is_pod_available(pod: &Pod, min_ready: Duration, now: DateTime<Utc>) -> bool {
    match pod_ready_since(pod) {
        None => false,
        Some(_) if min_ready.is_zero() => true,
        Some(None) => true,
        Some(Some(since)) => chrono::Duration::from_std(min_ready)
            .ok()
            .and_then(|min_ready| since.checked_add_signed(min_ready))
            .map(|available_at| available_at <= now)
            .unwrap_or(false),
    }
}

/// A live pod which is running & ready.
pub fn is_pod_healthy(pod: &Pod) -> bool {
    is_pod_live(pod) && is_pod_running(pod) && is_pod_ready(pod)
}

/// A pod which carries the deletion intent annotation.
pub fn is_pod_marked_for_deletion(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| annotations.contains_key(ANNOTATION_POD_DELETE))
        .unwrap_or(false)
}

/// A pod is updated when its template hash label matches, or when its template generation
/// label matches the NodeSet's template generation.
pub fn is_pod_updated(nodeset: &NodeSet, pod: &Pod, hash: &str) -> bool {
    let labels = match pod.metadata.labels.as_ref() {
        Some(labels) => labels,
        None => return false,
    };
    let hash_matches = !hash.is_empty() && labels.get(LABEL_TEMPLATE_HASH).map(String::as_str) == Some(hash);
    let generation_matches = nodeset
        .template_generation()
        .map(|generation| labels.get(LABEL_TEMPLATE_GENERATION) == Some(&generation.to_string()))
        .unwrap_or(false);
    hash_matches || generation_matches
}

/// Find the updated & stale live pods on a node.
///
/// Returns `None` if the node has more than one updated or more than one stale live pod.
pub fn find_updated_pods_on_node<'a>(nodeset: &NodeSet, pods: &'a [Pod], hash: &str) -> Option<(Option<&'a Pod>, Option<&'a Pod>)> {
    let (mut new_pod, mut old_pod) = (None, None);
    for pod in pods.iter().filter(|pod| is_pod_live(pod)) {
        let slot = if is_pod_updated(nodeset, pod, hash) { &mut new_pod } else { &mut old_pod };
        if slot.is_some() {
            return None;
        }
        *slot = Some(pod);
    }
    Some((new_pod, old_pod))
}
