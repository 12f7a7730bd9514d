use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::clientmap::ClientMap;
use crate::config::Config;
use crate::k8s::{NodeSetController, Registrar};
use crate::server::HttpServer;

/// The application object for when the operator is running.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<()>,
    /// The join handle of the NodeSet controller.
    controller: JoinHandle<Result<()>>,
    /// The join handle of the Slurm client registrar.
    registrar: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Spawn various core tasks.
        let server = HttpServer::new(config.clone(), metrics, shutdown_tx.clone())
            .spawn()
            .await
            .context("error setting up http server")?;

        let clients = Arc::new(ClientMap::new());
        let (changes_tx, changes_rx) = mpsc::channel(1);
        let registrar = Registrar::new(client.clone(), config.clone(), clients.clone(), changes_tx, shutdown_tx.clone()).spawn();
        let controller = NodeSetController::new(client, config.clone(), clients, changes_rx, shutdown_tx.clone()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
            registrar,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("slurm operator is shutting down");
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining http server task");
        }
        if let Err(err) = self.controller.await.context("error joining nodeset controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down nodeset controller");
        }
        if let Err(err) = self.registrar.await.context("error joining registrar handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down slurm client registrar");
        }

        tracing::debug!("slurm operator shutdown complete");
        Ok(())
    }
}
