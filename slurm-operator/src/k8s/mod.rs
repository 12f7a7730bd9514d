//! Kubernetes integration.
//!
//! The controller drives NodeSet reconciliation off of watch events, while the registrar
//! watches RestApi objects in order to keep the client map populated with a Slurm client per
//! Controller.

mod client;
mod controller;
mod registrar;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodCondition};

use slurm_core::crd::{NodeSet, NodeSetStatus};

pub use client::KubeClient;
pub use controller::NodeSetController;
pub use registrar::Registrar;

/// The Kubernetes operations performed while reconciling a NodeSet.
#[async_trait]
pub trait KubeOps: Send + Sync {
    /// List all nodes of the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// List the pods of the given namespace matching the given label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Get a pod, returning `None` when it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Create the given pod. A pod which already exists is not an error.
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Replace the given pod, failing on a resource version conflict.
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod. A pod which does not exist is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge the given conditions into the pod's status conditions.
    async fn patch_pod_conditions(&self, namespace: &str, name: &str, conditions: &[PodCondition]) -> Result<()>;

    /// Write the status of the given NodeSet.
    async fn update_nodeset_status(&self, nodeset: &NodeSet, status: &NodeSetStatus) -> Result<()>;
}
