pub mod auth;
pub mod conditions;
pub mod crd;
pub mod error;
pub mod hostlist;
pub mod podinfo;
pub mod slurm;

pub use error::{ErrorClass, SlurmError};

/// The API group of all CRDs managed by the operator.
pub const GROUP: &str = "slinky.slurm.net";

/// The prefix used on every Slurm node reason authored by the operator.
///
/// Reasons set by administrators or by Slurm itself never carry this prefix, which is how
/// the operator avoids undraining nodes it did not drain.
pub const NODE_REASON_PREFIX: &str = "slurm-operator:";

/// Annotation placed on a pod to signal that it should be drained and removed.
pub const ANNOTATION_POD_DELETE: &str = "slinky.slurm.net/pod-delete";
/// Annotation on a Kubernetes node holding an int32 weight used to rank nodes.
///
/// Lower weights rank first. This is honored on a best-effort basis only.
pub const ANNOTATION_NODE_WEIGHT: &str = "slinky.slurm.net/node-weight";
/// Annotation on a NodeSet holding the template generation, if any.
pub const ANNOTATION_TEMPLATE_GENERATION: &str = "deprecated.daemonset.template.generation";

/// Label holding the hash of the NodeSet template a pod was created from.
pub const LABEL_TEMPLATE_HASH: &str = "controller-revision-hash";
/// Label holding the template generation a pod was created from.
pub const LABEL_TEMPLATE_GENERATION: &str = "pod-template-generation";
/// Label identifying the NodeSet which owns a pod.
pub const LABEL_NODESET: &str = "slinky.slurm.net/nodeset";
/// Canonical instance label.
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Canonical managed-by label.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// The name used for the managed-by label and as the field manager for patches.
pub const APP_NAME: &str = "slurm-operator";
