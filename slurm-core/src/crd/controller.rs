//! Controller CRD.
//!
//! A Controller names a Slurm cluster. The core only reads the cluster name and the
//! reference to the HS256 key which slurmrestd uses to verify JWTs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type Controller = ControllerCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Controller resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "ControllerCRD",
    status = "ControllerStatus",
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "Controller",
    namespaced,
    derive = "PartialEq",
    shortname = "slurmctld",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    /// The name of the Slurm cluster.
    pub cluster_name: String,
    /// The Secret key holding the HS256 key used to sign Slurm JWTs.
    pub jwt_hs256_key_ref: SecretKeyRef,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ControllerStatus {}

/// A reference to a single key of a Secret in the same namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// The name of the Secret.
    pub name: String,
    /// The key within the Secret.
    pub key: String,
}
