//! Construction of NodeSet pods.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use slurm_core::crd::{NodeSet, RequiredMetadata};
use slurm_core::{APP_NAME, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NODESET, LABEL_TEMPLATE_GENERATION, LABEL_TEMPLATE_HASH};

/// The maximum length of a pod hostname.
const MAX_HOSTNAME_LEN: usize = 63;
/// The length of the node name hash appended to names which could not be kept verbatim.
const NODE_HASH_LEN: usize = 8;

/// The name of the pod of the given NodeSet on the given node.
///
/// The name doubles as the pod's hostname and as the name of its Slurm node, so it is kept
/// to a valid DNS label. When the node name has to be altered to fit, a hash of the full
/// node name is appended so that distinct nodes never share a pod name.
pub fn pod_name(nodeset: &NodeSet, node_name: &str) -> String {
    let raw = format!("{}-{}", nodeset.name(), node_name);
    let sanitized: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if sanitized == raw && sanitized.len() <= MAX_HOSTNAME_LEN && !sanitized.ends_with('-') {
        return sanitized;
    }

    let suffix = format!("{:08x}", seahash::hash(node_name.as_bytes()) as u32);
    let mut name: String = sanitized.chars().take(MAX_HOSTNAME_LEN - NODE_HASH_LEN - 1).collect();
    while name.ends_with('-') {
        name.pop();
    }
    format!("{}-{}", name, suffix)
}

/// Check if two pods are controlled by the same owner & bound to the same node.
pub fn is_same_placement(pod: &Pod, other: &Pod) -> bool {
    let controller_uid = |pod: &Pod| {
        pod.metadata
            .owner_references
            .iter()
            .flatten()
            .find(|owner| owner.controller == Some(true))
            .map(|owner| owner.uid.clone())
    };
    let node_name = |pod: &Pod| pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
    controller_uid(pod).is_some() && controller_uid(pod) == controller_uid(other) && node_name(pod) == node_name(other)
}

/// The label selector matching all pods of the given NodeSet.
pub fn selector(nodeset: &NodeSet) -> String {
    format!("{}={}", LABEL_NODESET, nodeset.name())
}

/// Build the pod of the given NodeSet for the given node.
pub fn new_pod(nodeset: &NodeSet, node_name: &str, hash: &str) -> Result<Pod> {
    let name = pod_name(nodeset, node_name);
    let template = &nodeset.spec.template;
    let template_meta = template.metadata.clone().unwrap_or_default();

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(LABEL_INSTANCE.into(), nodeset.name().into());
    labels.insert(LABEL_NODESET.into(), nodeset.name().into());
    labels.insert(LABEL_MANAGED_BY.into(), APP_NAME.into());
    labels.insert(LABEL_TEMPLATE_HASH.into(), hash.into());
    if let Some(generation) = nodeset.template_generation() {
        labels.insert(LABEL_TEMPLATE_GENERATION.into(), generation.to_string());
    }

    let owner = nodeset
        .controller_owner_ref(&())
        .with_context(|| format!("nodeset {} has no uid", nodeset.key()))?;

    let mut spec = template.spec.clone().unwrap_or_default();
    spec.node_name = Some(node_name.into());
    spec.hostname = Some(name.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(nodeset.namespace().into()),
            labels: Some(labels),
            annotations: template_meta.annotations,
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Check if the given pod is controlled by the given NodeSet.
pub fn is_owned_by(pod: &Pod, nodeset: &NodeSet) -> bool {
    let uid = match nodeset.meta().uid.as_deref() {
        Some(uid) => uid,
        None => return false,
    };
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}
