//! Per-pod operations against the Slurm cluster of a NodeSet.
//!
//! Every operation resolves the NodeSet's Slurm client through the client map. A NodeSet
//! whose Controller has no registered client is a steady state: mutations become no-ops,
//! boolean queries answer `true` and aggregations come back empty.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::clientmap::ClientMap;
use crate::nodeset::node_status::{self, SlurmNodeStatus};
use crate::nodeset::utils::{pod_hostname, pod_node_name};
use crate::resync::DeadlineStore;
use crate::slurm::{ListOptions, SlurmClient};
use slurm_core::crd::{NodeSet, RequiredMetadata};
use slurm_core::error::SlurmResultExt;
use slurm_core::hostlist;
use slurm_core::podinfo::PodInfo;
use slurm_core::slurm::{NodeState, SlurmNode, UpdateNodeMsg};
use slurm_core::NODE_REASON_PREFIX;

/// Prefix an operator authored node reason. Empty reasons stay empty.
pub fn prefixed_reason(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!("{} {}", NODE_REASON_PREFIX, reason)
    }
}

/// Slurm operations scoped to the cluster a NodeSet references.
#[derive(Clone)]
pub struct SlurmControl {
    clients: Arc<ClientMap>,
}

impl SlurmControl {
    pub fn new(clients: Arc<ClientMap>) -> Self {
        Self { clients }
    }

    fn lookup(&self, nodeset: &NodeSet) -> Option<Arc<dyn SlurmClient>> {
        self.clients.get(&nodeset.controller_key())
    }

    /// Check if a Slurm client is registered for the given NodeSet.
    pub fn has_client(&self, nodeset: &NodeSet) -> bool {
        self.clients.has(&nodeset.controller_key())
    }

    /// Fetch the Slurm node of the given pod; `None` when it does not exist.
    async fn get_node(&self, client: &dyn SlurmClient, pod: &Pod) -> Result<Option<SlurmNode>> {
        let name = pod_hostname(pod);
        client
            .get_node(name)
            .await
            .tolerate()
            .with_context(|| format!("error fetching slurm node {}", name))
    }

    /// Force the cached Slurm node listing to be refreshed.
    #[tracing::instrument(level = "debug", skip(self, nodeset), fields(nodeset = %nodeset.key()))]
    pub async fn refresh_node_cache(&self, nodeset: &NodeSet) -> Result<()> {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(()),
        };
        client
            .list_nodes(ListOptions::refresh())
            .await
            .tolerate()
            .context("error refreshing slurm node cache")?;
        Ok(())
    }

    /// List the Slurm nodes of the NodeSet's cluster.
    pub async fn list_nodes(&self, nodeset: &NodeSet) -> Result<Vec<SlurmNode>> {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(vec![]),
        };
        let nodes = client
            .list_nodes(ListOptions::default())
            .await
            .tolerate()
            .context("error listing slurm nodes")?;
        Ok(nodes.unwrap_or_default())
    }

    /// Delete the named Slurm node.
    pub async fn delete_node(&self, nodeset: &NodeSet, name: &str) -> Result<()> {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(()),
        };
        tracing::info!(node = name, nodeset = %nodeset.key(), "deleting slurm node");
        client
            .delete_node(name)
            .await
            .tolerate()
            .with_context(|| format!("error deleting slurm node {}", name))?;
        Ok(())
    }

    /// Record the pod's identity in its Slurm node's comment, if it differs.
    ///
    /// When the recorded Kubernetes node differs from the pod's current node, the Slurm node
    /// is also forced back to IDLE.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pod), fields(pod = %pod.key()))]
    pub async fn update_node_with_pod_info(&self, nodeset: &NodeSet, pod: &Pod) -> Result<()> {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(()),
        };
        let node = match self.get_node(client.as_ref(), pod).await? {
            Some(node) => node,
            None => return Ok(()),
        };

        let info = PodInfo {
            namespace: pod.namespace().into(),
            pod_name: pod.name().into(),
            node: pod_node_name(pod).unwrap_or_default().into(),
        };
        let old = PodInfo::parse_or_default(&node.comment);
        if old == info {
            tracing::trace!(node = %node.name, "slurm node already carries pod info");
            return Ok(());
        }

        tracing::info!(node = %node.name, pod_info = %info, "updating slurm node with pod info");
        let msg = UpdateNodeMsg {
            comment: Some(info.to_string()),
            ..Default::default()
        };
        client
            .update_node(&node.name, &msg)
            .await
            .tolerate()
            .with_context(|| format!("error updating slurm node {} with pod info", node.name))?;

        if !old.node.is_empty() && old.node != info.node {
            tracing::info!(node = %node.name, from = %old.node, to = %info.node, "resetting slurm node state after node migration");
            let msg = UpdateNodeMsg {
                state: Some(vec![NodeState::Idle]),
                ..Default::default()
            };
            client
                .update_node(&node.name, &msg)
                .await
                .tolerate()
                .with_context(|| format!("error resetting state of slurm node {}", node.name))?;
        }
        Ok(())
    }

    /// Drain the pod's Slurm node with the given reason.
    ///
    /// Skipped when the node is already DRAIN with the same reason.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pod), fields(pod = %pod.key()))]
    pub async fn make_node_drain(&self, nodeset: &NodeSet, pod: &Pod, reason: &str) -> Result<()> {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(()),
        };
        let node = match self.get_node(client.as_ref(), pod).await? {
            Some(node) => node,
            None => return Ok(()),
        };

        let reason = prefixed_reason(reason);
        if node.state.has(NodeState::Drain) && node.reason == reason {
            tracing::trace!(node = %node.name, "slurm node already drain, skipping drain request");
            return Ok(());
        }

        tracing::debug!(node = %node.name, reason = %reason, "draining slurm node");
        let msg = UpdateNodeMsg {
            state: Some(vec![NodeState::Drain]),
            reason: Some(reason),
            ..Default::default()
        };
        client
            .update_node(&node.name, &msg)
            .await
            .tolerate()
            .with_context(|| format!("error draining slurm node {}", node.name))?;
        Ok(())
    }

    /// Undrain the pod's Slurm node with the given reason.
    ///
    /// Skipped when the node is not DRAIN or is already UNDRAIN.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pod), fields(pod = %pod.key()))]
    pub async fn make_node_undrain(&self, nodeset: &NodeSet, pod: &Pod, reason: &str) -> Result<()> {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(()),
        };
        let node = match self.get_node(client.as_ref(), pod).await? {
            Some(node) => node,
            None => return Ok(()),
        };

        if !node.state.has(NodeState::Drain) || node.state.has(NodeState::Undrain) {
            tracing::trace!(node = %node.name, "slurm node already undrain, skipping undrain request");
            return Ok(());
        }

        tracing::debug!(node = %node.name, reason = %reason, "undraining slurm node");
        let msg = UpdateNodeMsg {
            state: Some(vec![NodeState::Undrain]),
            reason: Some(prefixed_reason(reason)),
            ..Default::default()
        };
        client
            .update_node(&node.name, &msg)
            .await
            .tolerate()
            .with_context(|| format!("error undraining slurm node {}", node.name))?;
        Ok(())
    }

    /// Run the given predicate against the pod's Slurm node, answering `true` when there is
    /// no client or no node.
    async fn check_node<F>(&self, nodeset: &NodeSet, pod: &Pod, check: F) -> Result<bool>
    where
        F: FnOnce(&SlurmNode) -> bool,
    {
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(true),
        };
        Ok(self.get_node(client.as_ref(), pod).await?.map(|node| check(&node)).unwrap_or(true))
    }

    /// Check if the pod's Slurm node has DRAIN.
    pub async fn is_node_drain(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool> {
        self.check_node(nodeset, pod, |node| node.state.has(NodeState::Drain)).await
    }

    /// Check if the pod's Slurm node is drained: DRAIN, not UNDRAIN and not busy.
    pub async fn is_node_drained(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool> {
        self.check_node(nodeset, pod, SlurmNode::is_drained).await
    }

    /// Check if the pod's Slurm node was marked DOWN for not responding.
    pub async fn is_node_down_for_unresponsive(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool> {
        self.check_node(nodeset, pod, SlurmNode::is_down_for_unresponsive).await
    }

    /// Check if the reason of the pod's Slurm node was set by the operator, or is empty.
    pub async fn is_node_reason_ours(&self, nodeset: &NodeSet, pod: &Pod) -> Result<bool> {
        self.check_node(nodeset, pod, |node| node.reason.is_empty() || node.reason.starts_with(NODE_REASON_PREFIX))
            .await
    }

    /// Aggregate the states of the Slurm nodes backing the given pods.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pods), fields(nodeset = %nodeset.key()))]
    pub async fn calculate_node_status(&self, nodeset: &NodeSet, pods: &[&Pod], now: DateTime<Utc>) -> Result<SlurmNodeStatus> {
        let hostnames: BTreeSet<&str> = pods.iter().map(|pod| pod_hostname(pod)).collect();
        let nodes = self.list_nodes(nodeset).await?;
        Ok(node_status::aggregate(&nodes, &hostnames, now))
    }

    /// Compute, per Slurm node, the time by which all running jobs touching the given pods'
    /// nodes will have ended.
    #[tracing::instrument(level = "debug", skip(self, nodeset, pods), fields(nodeset = %nodeset.key()))]
    pub async fn get_node_deadlines(&self, nodeset: &NodeSet, pods: &[&Pod]) -> Result<DeadlineStore> {
        let mut deadlines = DeadlineStore::new();
        let client = match self.lookup(nodeset) {
            Some(client) => client,
            None => return Ok(deadlines),
        };
        let hostnames: BTreeSet<&str> = pods.iter().map(|pod| pod_hostname(pod)).collect();
        let jobs = client
            .list_jobs()
            .await
            .tolerate()
            .context("error listing slurm jobs")?
            .unwrap_or_default();

        for job in jobs.iter().filter(|job| job.is_running()) {
            let job_nodes = hostlist::expand(&job.nodes).with_context(|| format!("error expanding nodes of slurm job {}", job.job_id))?;
            if !job_nodes.iter().any(|name| hostnames.contains(name.as_str())) {
                continue;
            }
            let deadline = job.deadline();
            for name in job_nodes.iter() {
                deadlines.push(name, deadline);
            }
        }
        Ok(deadlines)
    }
}
