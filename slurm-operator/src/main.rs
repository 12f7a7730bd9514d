//! The Slurm NodeSet operator.

mod app;
mod clientmap;
mod config;
#[cfg(test)]
mod fixtures;
mod k8s;
mod nodeset;
mod resync;
mod server;
mod slurm;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG config.
        .with(tracing_subscriber::EnvFilter::new(&cfg.rust_log))
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("error installing prometheus metrics recorder")?;

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = ?cfg.namespace,
        "starting slurm operator",
    );
    let app = App::new(cfg, metrics).await?;
    if let Err(err) = app.spawn().await.context("error joining app task").and_then(|res| res) {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
