//! HTTP server for healthchecks & metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// The HTTP server.
pub struct HttpServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A handle for rendering the Prometheus metrics.
    metrics: PrometheusHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl HttpServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { config, metrics, shutdown_tx }
    }

    /// Bind the server's socket & spawn the server.
    pub async fn spawn(self) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.http_port))
            .await
            .context("error binding socket address for http server")?;
        let app = router(self.metrics);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx;
        Ok(tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await;
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from http server, shutting down");
                let _res = shutdown_tx.send(());
            }
        }))
    }
}

/// Build the server's router.
fn router(metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(prom_metrics))
        .with_state(metrics)
}

async fn prom_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
