//! Slurm API clients.

mod rest;

use async_trait::async_trait;
use slurm_core::slurm::{SlurmJob, SlurmNode, UpdateNodeMsg};
use slurm_core::SlurmError;

pub use rest::RestClient;

/// Options for list calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListOptions {
    /// Bypass any cached listing, refreshing the cache from the server.
    pub refresh_cache: bool,
}

impl ListOptions {
    pub fn refresh() -> Self {
        Self { refresh_cache: true }
    }
}

/// The operations the operator performs against a Slurm cluster.
#[async_trait]
pub trait SlurmClient: Send + Sync {
    /// Fetch a single node by name.
    async fn get_node(&self, name: &str) -> Result<SlurmNode, SlurmError>;

    /// List all nodes of the cluster.
    async fn list_nodes(&self, opts: ListOptions) -> Result<Vec<SlurmNode>, SlurmError>;

    /// Apply the given update to the named node.
    async fn update_node(&self, name: &str, msg: &UpdateNodeMsg) -> Result<(), SlurmError>;

    /// Delete the named node from the cluster.
    async fn delete_node(&self, name: &str) -> Result<(), SlurmError>;

    /// List all jobs of the cluster.
    async fn list_jobs(&self) -> Result<Vec<SlurmJob>, SlurmError>;
}
