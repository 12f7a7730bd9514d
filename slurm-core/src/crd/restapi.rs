//! RestApi CRD.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ObjectKey, ObjectReference, RequiredMetadata};

/// The port slurmrestd listens on when none is given.
pub const RESTAPI_DEFAULT_PORT: u16 = 6820;

pub type RestApi = RestApiCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the RestApi resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "RestApiCRD",
    status = "RestApiStatus",
    group = "slinky.slurm.net",
    version = "v1beta1",
    kind = "RestApi",
    namespaced,
    derive = "PartialEq",
    shortname = "slurmrestd",
    printcolumn = r#"{"name":"Controller","type":"string","jsonPath":".spec.controllerRef.name"}"#,
    printcolumn = r#"{"name":"Port","type":"number","jsonPath":".spec.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestApiSpec {
    /// The Controller which this slurmrestd serves.
    pub controller_ref: ObjectReference,
    /// The desired number of slurmrestd replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The port of the slurmrestd service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct RestApiStatus {}

impl RestApi {
    /// The key of the Controller which this RestApi serves.
    pub fn controller_key(&self) -> ObjectKey {
        self.spec.controller_ref.key(self.namespace())
    }

    /// The name of the Service fronting this slurmrestd.
    pub fn service_name(&self) -> String {
        format!("{}-restapi", self.name())
    }

    /// The in-cluster URL of this slurmrestd.
    pub fn service_url(&self) -> String {
        format!(
            "http://{}.{}.svc.cluster.local:{}",
            self.service_name(),
            self.namespace(),
            self.spec.port.unwrap_or(RESTAPI_DEFAULT_PORT)
        )
    }
}
