//! The registry of Slurm clients, keyed by the Controller they belong to.

use std::sync::Arc;

use dashmap::DashMap;

use crate::slurm::SlurmClient;
use slurm_core::crd::ObjectKey;

/// A concurrent map of Controller key to the Slurm client of that Controller's cluster.
#[derive(Default)]
pub struct ClientMap {
    clients: DashMap<ObjectKey, Arc<dyn SlurmClient>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the client registered under the given key, if any.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<dyn SlurmClient>> {
        self.clients.get(key).map(|client| client.value().clone())
    }

    /// Register a client under the given key, replacing any previous client.
    pub fn add(&self, key: ObjectKey, client: Arc<dyn SlurmClient>) {
        tracing::debug!(controller = %key, "registering slurm client");
        self.clients.insert(key, client);
    }

    /// Unregister the client of the given key, returning true if one was registered.
    pub fn remove(&self, key: &ObjectKey) -> bool {
        tracing::debug!(controller = %key, "unregistering slurm client");
        self.clients.remove(key).is_some()
    }

    pub fn has(&self, key: &ObjectKey) -> bool {
        self.clients.contains_key(key)
    }
}
