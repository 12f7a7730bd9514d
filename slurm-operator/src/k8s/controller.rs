//! The NodeSet controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use futures::prelude::*;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::KubeClient;
use crate::clientmap::ClientMap;
use crate::config::Config;
use crate::nodeset::{NodeSetReconciler, SlurmControl};
use crate::resync::DurationStore;
use slurm_core::crd::{NodeSet, ObjectKey, RequiredMetadata};
use slurm_core::{APP_NAME, LABEL_MANAGED_BY};

const METRIC_RECONCILE: &str = "slurm_operator_reconcile_total";
const METRIC_RECONCILE_ERRORS: &str = "slurm_operator_reconcile_errors_total";
const METRIC_RECONCILE_SECONDS: &str = "slurm_operator_reconcile_duration_seconds";

/// The requeue period of a NodeSet with nothing pending.
const DEFAULT_REQUEUE: Duration = Duration::from_secs(300);
/// The requeue period of a NodeSet whose pass timed out.
const TIMEOUT_REQUEUE: Duration = Duration::from_secs(1);
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// The error type returned from reconcile passes.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ReconcileError(#[from] anyhow::Error);

/// The requeue delay after the given number of consecutive failures.
pub(super) fn backoff_after(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_MAX)
}

/// State shared by all reconcile passes.
struct Context {
    reconciler: NodeSetReconciler,
    resync: Arc<DurationStore>,
    /// Consecutive failures per NodeSet.
    failures: DashMap<ObjectKey, u32>,
    timeout: Duration,
    /// The controller's cache of NodeSets.
    nodesets: Store<NodeSet>,
}

impl Context {
    /// Drop all bookkeeping of the given NodeSet.
    fn forget(&self, key: &ObjectKey) {
        self.failures.remove(key);
        let _ = self.resync.pop(key);
    }

    /// Drop the bookkeeping of all NodeSets which are no longer known to the cache.
    fn prune(&self) {
        let is_known = |key: &ObjectKey| self.nodesets.get(&ObjectRef::new(&key.name).within(&key.namespace)).is_some();
        prune_bookkeeping(&self.failures, &self.resync, is_known);
    }
}

/// Drop the failure counts & pending resyncs of all objects not matching `is_known`.
pub(super) fn prune_bookkeeping(failures: &DashMap<ObjectKey, u32>, resync: &DurationStore, is_known: impl Fn(&ObjectKey) -> bool) {
    failures.retain(|key, _| is_known(key));
    resync.retain(|key| is_known(key));
}

/// Drives NodeSet reconciliation off of K8s watch events.
pub struct NodeSetController {
    client: Client,
    config: Arc<Config>,
    clients: Arc<ClientMap>,
    /// Signals that the set of registered Slurm clients changed.
    changes_rx: mpsc::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeSetController {
    pub fn new(
        client: Client, config: Arc<Config>, clients: Arc<ClientMap>, changes_rx: mpsc::Receiver<()>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            client,
            config,
            clients,
            changes_rx,
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let (nodesets, pods): (Api<NodeSet>, Api<Pod>) = match self.config.namespace.as_deref() {
            Some(ns) => (Api::namespaced(self.client.clone(), ns), Api::namespaced(self.client.clone(), ns)),
            None => (Api::all(self.client.clone()), Api::all(self.client.clone())),
        };
        let nodes: Api<Node> = Api::all(self.client.clone());

        let pods_config = watcher::Config::default().labels(&format!("{}={}", LABEL_MANAGED_BY, APP_NAME));
        let controller = Controller::new(nodesets, watcher::Config::default());
        let store = controller.store();

        let resync = Arc::new(DurationStore::new());
        let ctx = Arc::new(Context {
            reconciler: NodeSetReconciler::new(
                Arc::new(KubeClient::new(self.client.clone())),
                SlurmControl::new(self.clients.clone()),
                resync.clone(),
            ),
            resync,
            failures: DashMap::new(),
            timeout: self.config.reconcile_timeout(),
            nodesets: store.clone(),
        });

        // Bridge the app's shutdown broadcast into the controller's shutdown trigger.
        let (stop_tx, stop_rx) = futures::channel::oneshot::channel::<()>();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            let _ = stop_tx.send(());
        });

        tracing::info!("nodeset controller initialized");
        controller
            .owns(pods, pods_config)
            .watches(nodes, watcher::Config::default(), move |_node: Node| {
                store.state().iter().map(|nodeset| ObjectRef::from_obj(nodeset.as_ref())).collect::<Vec<_>>()
            })
            .reconcile_all_on(ReceiverStream::new(self.changes_rx))
            .graceful_shutdown_on(stop_rx.map(|_| ()))
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => tracing::trace!(nodeset = %obj, "reconciled nodeset"),
                    Err(err) => tracing::debug!(error = ?err, "nodeset reconcile failed"),
                }
            })
            .await;

        tracing::debug!("nodeset controller shutdown");
        Ok(())
    }
}

/// Run a single reconcile pass over the given NodeSet.
async fn reconcile(nodeset: Arc<NodeSet>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let key = nodeset.key();
    ctx.prune();
    if nodeset.metadata.deletion_timestamp.is_some() {
        tracing::debug!(nodeset = %key, "nodeset is being deleted, skipping");
        ctx.forget(&key);
        return Ok(Action::await_change());
    }

    let start = Instant::now();
    counter!(METRIC_RECONCILE).increment(1);
    let res = tokio::time::timeout(ctx.timeout, ctx.reconciler.sync(&nodeset, Utc::now())).await;
    histogram!(METRIC_RECONCILE_SECONDS).record(start.elapsed().as_secs_f64());

    match res {
        Err(_elapsed) => {
            tracing::debug!(nodeset = %key, timeout = ?ctx.timeout, "reconcile pass timed out, requeueing");
            Ok(Action::requeue(TIMEOUT_REQUEUE))
        }
        Ok(Err(err)) => {
            counter!(METRIC_RECONCILE_ERRORS).increment(1);
            Err(ReconcileError(err))
        }
        Ok(Ok(())) => {
            ctx.failures.remove(&key);
            let after = ctx.resync.pop(&key).unwrap_or(DEFAULT_REQUEUE);
            tracing::debug!(nodeset = %key, ?after, "reconciled nodeset");
            Ok(Action::requeue(after))
        }
    }
}

/// Requeue a failed NodeSet with per-object exponential backoff.
fn error_policy(nodeset: Arc<NodeSet>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = nodeset.key();
    let _ = ctx.resync.pop(&key);
    let attempts = {
        let mut failures = ctx.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        *failures
    };
    let after = backoff_after(attempts);
    tracing::warn!(error = ?err.0, nodeset = %key, attempts, ?after, "error reconciling nodeset");
    Action::requeue(after)
}
