//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The operator's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port used for HTTP healthchecks & metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace to watch; all namespaces when unset.
    #[serde(default)]
    pub namespace: Option<String>,

    /// The maximum duration of a single reconcile pass, in seconds.
    #[serde(default = "Config::default_reconcile_timeout_seconds")]
    pub reconcile_timeout_seconds: u64,
    /// The timeout of a single slurmrestd request, in seconds.
    #[serde(default = "Config::default_slurm_api_timeout_seconds")]
    pub slurm_api_timeout_seconds: u64,
    /// The duration for which a listing of Slurm nodes may be served from cache, in seconds.
    #[serde(default = "Config::default_slurm_node_cache_seconds")]
    pub slurm_node_cache_seconds: u64,

    /// The Slurm user which the operator authenticates as.
    #[serde(default = "Config::default_slurm_user")]
    pub slurm_user: String,
    /// The lifetime of minted Slurm JWTs, in seconds.
    ///
    /// Tokens are re-minted at half of this interval.
    #[serde(default = "Config::default_slurm_token_lifetime_seconds")]
    pub slurm_token_lifetime_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_seconds)
    }

    pub fn slurm_api_timeout(&self) -> Duration {
        Duration::from_secs(self.slurm_api_timeout_seconds)
    }

    pub fn slurm_node_cache(&self) -> Duration {
        Duration::from_secs(self.slurm_node_cache_seconds)
    }

    pub fn slurm_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.slurm_token_lifetime_seconds)
    }

    /// The interval at which Slurm JWTs are re-minted.
    pub fn slurm_token_refresh(&self) -> Duration {
        Duration::from_secs((self.slurm_token_lifetime_seconds / 2).max(1))
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_reconcile_timeout_seconds() -> u64 {
        30
    }

    fn default_slurm_api_timeout_seconds() -> u64 {
        10
    }

    fn default_slurm_node_cache_seconds() -> u64 {
        5
    }

    fn default_slurm_user() -> String {
        "slurm".into()
    }

    fn default_slurm_token_lifetime_seconds() -> u64 {
        3600
    }

    /// A config suitable for tests.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            rust_log: "debug".into(),
            http_port: 8080,
            namespace: None,
            reconcile_timeout_seconds: Self::default_reconcile_timeout_seconds(),
            slurm_api_timeout_seconds: Self::default_slurm_api_timeout_seconds(),
            slurm_node_cache_seconds: 0,
            slurm_user: Self::default_slurm_user(),
            slurm_token_lifetime_seconds: Self::default_slurm_token_lifetime_seconds(),
        }
    }
}
