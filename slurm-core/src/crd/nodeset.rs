//! NodeSet CRD.
//!
//! A NodeSet runs one slurmd pod per matching Kubernetes node (or a fixed number of pods
//! when `replicas` is set), keeping each pod's Slurm node in step with the pod's lifecycle.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ObjectKey, ObjectReference, RequiredMetadata};
use crate::ANNOTATION_TEMPLATE_GENERATION;

pub type NodeSet = NodeSetCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the NodeSet resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "NodeSetCRD",
    status = "NodeSetStatus",
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "NodeSet",
    namespaced,
    derive = "PartialEq",
    shortname = "nodesets",
    shortname = "nss",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredNumberScheduled"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.numberReady"}"#,
    printcolumn = r#"{"name":"Updated","type":"integer","jsonPath":".status.updatedNumberScheduled"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.numberAvailable"}"#,
    printcolumn = r#"{"name":"Idle","type":"integer","jsonPath":".status.numberIdle"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.numberAllocated"}"#,
    printcolumn = r#"{"name":"Drain","type":"integer","jsonPath":".status.numberDrain"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// The Controller of the Slurm cluster which this NodeSet's pods join.
    pub controller_ref: ObjectReference,
    /// The exact number of pods to run.
    ///
    /// When unset, one pod is run on every Kubernetes node matching the template's placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The template of the pods to run.
    pub template: PodTemplateSpec,
    /// The strategy used to replace stale pods.
    #[serde(default)]
    pub update_strategy: NodeSetUpdateStrategy,
    /// The number of seconds a ready pod must stay ready before it counts as available.
    #[serde(default)]
    pub min_ready_seconds: i32,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// The number of nodes which should be running a pod.
    #[serde(default)]
    pub desired_number_scheduled: i32,
    /// The number of nodes running at least one pod which should be.
    #[serde(default)]
    pub current_number_scheduled: i32,
    /// The number of nodes running a pod which should not be.
    #[serde(default)]
    pub number_misscheduled: i32,
    #[serde(default)]
    pub number_ready: i32,
    #[serde(default)]
    pub updated_number_scheduled: i32,
    #[serde(default)]
    pub number_available: i32,
    #[serde(default)]
    pub number_unavailable: i32,
    /// The number of Slurm nodes which are idle.
    #[serde(default)]
    pub number_idle: i32,
    /// The number of Slurm nodes which are allocated or mixed.
    #[serde(default)]
    pub number_allocated: i32,
    #[serde(default)]
    pub number_down: i32,
    #[serde(default)]
    pub number_drain: i32,
    /// The hash of the current pod template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_set_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    /// The label selector of this NodeSet's pods, in string form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

/// The update strategy of a NodeSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetUpdateStrategy {
    #[serde(default, rename = "type")]
    pub type_: NodeSetUpdateStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateNodeSetStrategy>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum NodeSetUpdateStrategyType {
    /// Replace stale pods automatically, bounded by `maxUnavailable`.
    #[default]
    RollingUpdate,
    /// Replace stale pods only once they are deleted by hand.
    OnDelete,
}

/// Parameters of the rolling update strategy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateNodeSetStrategy {
    /// The maximum number of pods which may be unavailable during the update.
    ///
    /// Either an absolute number or a percentage of the desired pods, rounded up. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    /// The number of nodes, in weight order, whose pods are left at their current revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

impl NodeSet {
    /// The key of the Controller which this NodeSet references.
    pub fn controller_key(&self) -> ObjectKey {
        self.spec.controller_ref.key(self.namespace())
    }

    /// The template generation of this NodeSet, if it carries one.
    ///
    /// A malformed annotation is treated as absent.
    pub fn template_generation(&self) -> Option<i64> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_TEMPLATE_GENERATION))
            .and_then(|val| val.parse::<i64>().ok())
    }

    /// The rolling update partition, which is never negative.
    pub fn partition(&self) -> usize {
        self.spec
            .update_strategy
            .rolling_update
            .as_ref()
            .and_then(|ru| ru.partition)
            .map(|val| val.max(0) as usize)
            .unwrap_or(0)
    }

    /// The configured min ready duration.
    pub fn min_ready(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.spec.min_ready_seconds.max(0) as u64)
    }
}
