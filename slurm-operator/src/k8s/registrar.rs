//! Slurm client registration.
//!
//! The registrar watches RestApi objects. For each one it resolves the referenced
//! Controller, mints a JWT from the Controller's HS256 key & registers a slurmrestd client
//! in the client map under the Controller's key. Tokens are re-minted on an interval.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::watcher::{self, watcher, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::clientmap::ClientMap;
use crate::config::Config;
use crate::slurm::RestClient;
use slurm_core::auth::SlurmTokenClaims;
use slurm_core::crd::{Controller, ObjectKey, RequiredMetadata, RestApi};

/// Read the HS256 key stored under `key` in the given Secret.
pub fn secret_key_bytes(secret: &Secret, key: &str) -> Result<Vec<u8>> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|val| val.0.clone())
        .ok_or_else(|| anyhow!("secret {} has no key {}", name, key))?;
    if bytes.is_empty() {
        return Err(anyhow!("key {} of secret {} is empty", key, name));
    }
    Ok(bytes)
}

/// Mint a Slurm JWT for the given user.
pub fn mint_token(user: &str, key: &[u8], now: DateTime<Utc>, lifetime: std::time::Duration) -> Result<String> {
    let lifetime = chrono::Duration::from_std(lifetime).context("invalid slurm token lifetime")?;
    SlurmTokenClaims::new(user, now, lifetime).encode(key)
}

/// A Slurm client registered on behalf of a RestApi.
struct Registration {
    controller: ObjectKey,
    url: String,
    client: Arc<RestClient>,
}

/// The bookkeeping of registered clients, keyed by RestApi.
pub struct Registry {
    clients: Arc<ClientMap>,
    registrations: BTreeMap<ObjectKey, Registration>,
}

impl Registry {
    pub fn new(clients: Arc<ClientMap>) -> Self {
        Self {
            clients,
            registrations: BTreeMap::new(),
        }
    }

    /// Install a client for the given RestApi, returning `true` if the client map changed.
    ///
    /// An existing client for the same Controller & URL only has its token replaced.
    pub async fn install(&mut self, restapi: ObjectKey, controller: ObjectKey, url: String, token: String, config: &Config) -> Result<bool> {
        if let Some(reg) = self.registrations.get(&restapi) {
            if reg.controller == controller && reg.url == url {
                reg.client.set_token(token).await;
                return Ok(false);
            }
        }

        let client = Arc::new(
            RestClient::new(&url, config.slurm_user.clone(), token, config.slurm_api_timeout(), config.slurm_node_cache())
                .with_context(|| format!("error building slurm client for {}", url))?,
        );
        let old = self.registrations.insert(
            restapi,
            Registration {
                controller: controller.clone(),
                url,
                client: client.clone(),
            },
        );
        if let Some(old) = old {
            if old.controller != controller {
                self.release(&old.controller);
            }
        }
        tracing::info!(controller = %controller, url = client.base_url(), "registered slurm client");
        self.clients.add(controller, client);
        Ok(true)
    }

    /// Remove the registration of the given RestApi, returning `true` if its controller lost its client.
    pub fn uninstall(&mut self, restapi: &ObjectKey) -> bool {
        match self.registrations.remove(restapi) {
            Some(reg) => {
                tracing::info!(controller = %reg.controller, "unregistered slurm client");
                self.release(&reg.controller)
            }
            None => false,
        }
    }

    /// Drop the client of a controller which lost a registration, returning `true` if the
    /// controller no longer has a client.
    ///
    /// When another RestApi still references the controller, its client takes over.
    fn release(&self, controller: &ObjectKey) -> bool {
        match self.registrations.values().find(|reg| &reg.controller == controller) {
            Some(remaining) => {
                self.clients.add(controller.clone(), remaining.client.clone());
                false
            }
            None => self.clients.remove(controller),
        }
    }

    /// The RestApis which currently have a registered client.
    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.registrations.keys()
    }
}

/// Watches RestApi objects & keeps the client map in sync with them.
pub struct Registrar {
    client: Client,
    config: Arc<Config>,
    registry: Registry,
    /// All known RestApi objects, registered or not.
    restapis: BTreeMap<ObjectKey, RestApi>,
    /// RestApis seen during a watcher re-list.
    relist: Option<BTreeSet<ObjectKey>>,

    /// A channel used to signal that the set of registered clients changed.
    changes_tx: mpsc::Sender<()>,
    shutdown_rx: BroadcastStream<()>,
}

impl Registrar {
    pub fn new(client: Client, config: Arc<Config>, clients: Arc<ClientMap>, changes_tx: mpsc::Sender<()>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            client,
            config,
            registry: Registry::new(clients),
            restapis: BTreeMap::new(),
            relist: None,
            changes_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let restapis: Api<RestApi> = match self.config.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let restapis_watcher = watcher(restapis, watcher::Config::default());
        let mut refresh = IntervalStream::new(tokio::time::interval(self.config.slurm_token_refresh()));
        tokio::pin!(restapis_watcher);

        tracing::info!("slurm client registrar initialized");
        loop {
            tokio::select! {
                Some(event_res) = restapis_watcher.next() => self.handle_restapi_event(event_res).await,
                Some(_) = refresh.next() => self.refresh_all().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("slurm client registrar shutdown");
        Ok(())
    }

    /// Handle a `RestApi` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_restapi_event(&mut self, res: Result<Event<RestApi>, watcher::Error>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from RestApi k8s watcher");
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Apply(restapi) => self.restapi_applied(restapi).await,
            Event::Delete(restapi) => self.restapi_deleted(restapi),
            Event::Init => self.relist = Some(BTreeSet::new()),
            Event::InitApply(restapi) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(restapi.key());
                }
                self.restapi_applied(restapi).await;
            }
            Event::InitDone => self.restapis_relisted(),
        }
    }

    async fn restapi_applied(&mut self, restapi: RestApi) {
        let key = restapi.key();
        if self.restapis.get(&key) == Some(&restapi) && self.registry.registrations.contains_key(&key) {
            return;
        }
        self.restapis.insert(key.clone(), restapi.clone());
        if let Err(err) = self.register(&restapi).await {
            tracing::error!(error = ?err, restapi = %key, "error registering slurm client");
        }
    }

    fn restapi_deleted(&mut self, restapi: RestApi) {
        let key = restapi.key();
        self.restapis.remove(&key);
        if self.registry.uninstall(&key) {
            self.notify();
        }
    }

    /// Drop all RestApis which vanished while the watcher was re-listing.
    fn restapis_relisted(&mut self) {
        let seen = match self.relist.take() {
            Some(seen) => seen,
            None => return,
        };
        let stale: Vec<ObjectKey> = self
            .restapis
            .keys()
            .chain(self.registry.keys())
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        let mut changed = false;
        for key in stale {
            self.restapis.remove(&key);
            changed |= self.registry.uninstall(&key);
        }
        if changed {
            self.notify();
        }
    }

    /// Re-mint the tokens of all known RestApis, retrying failed registrations.
    async fn refresh_all(&mut self) {
        let restapis: Vec<RestApi> = self.restapis.values().cloned().collect();
        for restapi in restapis {
            if let Err(err) = self.register(&restapi).await {
                tracing::error!(error = ?err, restapi = %restapi.key(), "error refreshing slurm client");
            }
        }
    }

    /// Register a Slurm client for the given RestApi.
    #[tracing::instrument(level = "debug", skip(self, restapi), fields(restapi = %restapi.key()))]
    async fn register(&mut self, restapi: &RestApi) -> Result<()> {
        let controller_key = restapi.controller_key();
        let controllers: Api<Controller> = Api::namespaced(self.client.clone(), &controller_key.namespace);
        let controller = controllers
            .get_opt(&controller_key.name)
            .await
            .with_context(|| format!("error fetching controller {}", controller_key))?
            .ok_or_else(|| anyhow!("controller {} not found", controller_key))?;

        let key_ref = &controller.spec.jwt_hs256_key_ref;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), controller.namespace());
        let secret = secrets
            .get(&key_ref.name)
            .await
            .with_context(|| format!("error fetching secret {} of controller {}", key_ref.name, controller_key))?;
        let key = secret_key_bytes(&secret, &key_ref.key)?;
        let token = mint_token(&self.config.slurm_user, &key, Utc::now(), self.config.slurm_token_lifetime())?;

        let changed = self
            .registry
            .install(restapi.key(), controller_key, restapi.service_url(), token, &self.config)
            .await?;
        if changed {
            self.notify();
        }
        Ok(())
    }

    fn notify(&self) {
        // A full channel already guarantees a pending reconcile of everything.
        let _ = self.changes_tx.try_send(());
    }
}
