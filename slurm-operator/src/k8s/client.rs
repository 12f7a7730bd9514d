use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodCondition};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use serde_json::json;

use super::KubeOps;
use crate::nodeset::pods::is_same_placement;
use slurm_core::crd::{NodeSet, NodeSetStatus, RequiredMetadata};
use slurm_core::APP_NAME;

/// The `KubeOps` implementation backed by the K8s API.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Check if the given error is a K8s API error with the given status code.
fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(res) if res.code == code)
}

#[async_trait]
impl KubeOps for KubeClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await.context("error listing nodes")?;
        Ok(nodes.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(selector);
        let pods = self.pods(namespace).list(&params).await.context("error listing pods")?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pods(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("error fetching pod {}/{}", namespace, name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        match self.pods(pod.namespace()).create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, 409) => {
                let existing = self.get_pod(pod.namespace(), pod.name()).await?;
                match existing {
                    Some(existing) if is_same_placement(&existing, pod) => Ok(()),
                    _ => Err(anyhow!("pod {} already exists with a different owner or node", pod.key())),
                }
            }
            Err(err) => Err(err).with_context(|| format!("error creating pod {}", pod.key())),
        }
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod> {
        self.pods(pod.namespace())
            .replace(pod.name(), &PostParams::default(), pod)
            .await
            .with_context(|| format!("error replacing pod {}", pod.key()))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, 404) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("error deleting pod {}/{}", namespace, name)),
        }
    }

    async fn patch_pod_conditions(&self, namespace: &str, name: &str, conditions: &[PodCondition]) -> Result<()> {
        let patch = Patch::Strategic(json!({"status": {"conditions": conditions}}));
        match self.pods(namespace).patch_status(name, &PatchParams::default(), &patch).await {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, 404) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("error patching conditions of pod {}/{}", namespace, name)),
        }
    }

    async fn update_nodeset_status(&self, nodeset: &NodeSet, status: &NodeSetStatus) -> Result<()> {
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), nodeset.namespace());
        let patch = Patch::Merge(json!({"status": status}));
        let params = PatchParams {
            field_manager: Some(APP_NAME.into()),
            ..Default::default()
        };
        api.patch_status(nodeset.name(), &params, &patch)
            .await
            .with_context(|| format!("error updating status of nodeset {}", nodeset.key()))?;
        Ok(())
    }
}
