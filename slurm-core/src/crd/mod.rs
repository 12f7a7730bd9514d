//! Slurm operator CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod controller;
mod nodeset;
mod restapi;

use std::fmt;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use controller::{Controller, ControllerSpec, ControllerStatus, SecretKeyRef};
pub use nodeset::{
    NodeSet, NodeSetSpec, NodeSetStatus, NodeSetUpdateStrategy, NodeSetUpdateStrategyType, RollingUpdateNodeSetStrategy,
};
pub use restapi::{RestApi, RestApiSpec, RestApiStatus, RESTAPI_DEFAULT_PORT};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// The namespace/name key of this object.
    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

impl RequiredMetadata for NodeSet {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for Controller {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for RestApi {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for Pod {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for Node {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

/// A reference to another namespaced object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// The namespace of the referent; defaults to the namespace of the referring object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The name of the referent.
    pub name: String,
}

impl ObjectReference {
    /// Resolve this reference into a key, defaulting the namespace to the given one.
    pub fn key(&self, default_namespace: &str) -> ObjectKey {
        let namespace = self.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(default_namespace);
        ObjectKey::new(namespace, &self.name)
    }
}

/// A fully resolved namespace/name pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_reference_defaults_namespace() {
        let reference = ObjectReference { namespace: None, name: "slurm".into() };
        let key = reference.key("hpc");
        assert!(key.to_string() == "hpc/slurm", "expected hpc/slurm, got {}", key);

        let reference = ObjectReference { namespace: Some("other".into()), name: "slurm".into() };
        let key = reference.key("hpc");
        assert!(key.to_string() == "other/slurm", "expected other/slurm, got {}", key);
    }

    #[test]
    fn object_reference_treats_empty_namespace_as_unset() {
        let reference = ObjectReference { namespace: Some(String::new()), name: "slurm".into() };
        let key = reference.key("hpc");
        assert!(key.namespace == "hpc", "expected namespace hpc, got {}", key.namespace);
    }
}
