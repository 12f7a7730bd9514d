//! A slurmrestd client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::{ListOptions, SlurmClient};
use slurm_core::auth::{HEADER_USER_NAME, HEADER_USER_TOKEN};
use slurm_core::slurm::{ApiMessage, EmptyResponse, JobsResponse, NodesResponse, SlurmJob, SlurmNode, UpdateNodeMsg, SLURM_API_VERSION};
use slurm_core::SlurmError;

/// The metric counting requests made to slurmrestd.
pub const METRIC_SLURM_REQUESTS: &str = "slurm_operator_slurm_requests_total";

/// A client of a single slurmrestd endpoint.
pub struct RestClient {
    /// The base URL of slurmrestd, without a trailing slash.
    base_url: String,
    /// The Slurm user which requests authenticate as.
    user: String,
    /// The current JWT, swapped out as it is re-minted.
    token: RwLock<String>,
    http: reqwest::Client,
    /// The cached node listing, along with the time at which it was fetched.
    node_cache: Mutex<Option<(Instant, Vec<SlurmNode>)>>,
    node_cache_ttl: Duration,
}

impl RestClient {
    /// Create a new instance.
    pub fn new(base_url: &str, user: String, token: String, timeout: Duration, node_cache_ttl: Duration) -> Result<Self, SlurmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SlurmError::Transport(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            token: RwLock::new(token),
            http,
            node_cache: Mutex::new(None),
            node_cache_ttl,
        })
    }

    /// Replace the token used by subsequent requests.
    pub async fn set_token(&self, token: String) {
        *self.token.write().await = token;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/slurm/{}/{}", self.base_url, SLURM_API_VERSION, path)
    }

    /// Drop any cached node listing.
    async fn invalidate_nodes(&self) {
        *self.node_cache.lock().await = None;
    }

    #[tracing::instrument(level = "trace", skip(self, body))]
    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, SlurmError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.token.read().await.clone();
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .header(HEADER_USER_NAME, &self.user)
            .header(HEADER_USER_TOKEN, token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = req.send().await.map_err(|err| {
            metrics::counter!(METRIC_SLURM_REQUESTS, "method" => method.to_string(), "status" => "error").increment(1);
            SlurmError::Transport(err.to_string())
        })?;
        let status = res.status();
        metrics::counter!(METRIC_SLURM_REQUESTS, "method" => method.to_string(), "status" => status.as_u16().to_string()).increment(1);
        let body = res.text().await.map_err(|err| SlurmError::Transport(err.to_string()))?;
        check_status(status, &body)?;
        decode_body(&body)
    }
}

/// Map a response status to an error, using the body's error entries for context.
pub(super) fn check_status(status: StatusCode, body: &str) -> Result<(), SlurmError> {
    match status {
        StatusCode::NO_CONTENT => Err(SlurmError::NoContent),
        StatusCode::NOT_FOUND => Err(SlurmError::NotFound),
        status if status.is_success() => Ok(()),
        status => {
            let message = serde_json::from_str::<EmptyResponse>(body)
                .ok()
                .and_then(|res| res.errors.into_iter().next())
                .map(describe)
                .unwrap_or_else(|| body.trim().to_string());
            Err(SlurmError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Decode a successful response body.
pub(super) fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T, SlurmError> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|err| SlurmError::Decode(err.to_string()))
}

fn describe(msg: ApiMessage) -> String {
    match (msg.error.is_empty(), msg.description.is_empty()) {
        (false, false) => format!("{}: {}", msg.error, msg.description),
        (false, true) => msg.error,
        _ => msg.description,
    }
}

#[async_trait]
impl SlurmClient for RestClient {
    async fn get_node(&self, name: &str) -> Result<SlurmNode, SlurmError> {
        let res: NodesResponse = self.request::<(), _>(Method::GET, &format!("node/{}", name), None).await?;
        res.nodes.into_iter().find(|node| node.name == name).ok_or(SlurmError::NotFound)
    }

    async fn list_nodes(&self, opts: ListOptions) -> Result<Vec<SlurmNode>, SlurmError> {
        let mut cache = self.node_cache.lock().await;
        if !opts.refresh_cache {
            if let Some((fetched, nodes)) = cache.as_ref() {
                if fetched.elapsed() < self.node_cache_ttl {
                    return Ok(nodes.clone());
                }
            }
        }
        let res: NodesResponse = self.request::<(), _>(Method::GET, "nodes", None).await?;
        *cache = Some((Instant::now(), res.nodes.clone()));
        Ok(res.nodes)
    }

    async fn update_node(&self, name: &str, msg: &UpdateNodeMsg) -> Result<(), SlurmError> {
        let _: EmptyResponse = self.request(Method::POST, &format!("node/{}", name), Some(msg)).await?;
        self.invalidate_nodes().await;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), SlurmError> {
        let _: EmptyResponse = self.request::<(), _>(Method::DELETE, &format!("node/{}", name), None).await?;
        self.invalidate_nodes().await;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<SlurmJob>, SlurmError> {
        let res: JobsResponse = self.request::<(), _>(Method::GET, "jobs", None).await?;
        Ok(res.jobs)
    }
}
