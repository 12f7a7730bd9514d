//! In-memory fakes & builders shared by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Node, NodeSpec, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use maplit::btreemap;

use crate::clientmap::ClientMap;
use crate::k8s::KubeOps;
use crate::nodeset::utils::{pod_node_name, PodsByNode};
use crate::nodeset::{pods, NodeSetReconciler, SlurmControl};
use crate::resync::DurationStore;
use crate::slurm::{ListOptions, SlurmClient};
use slurm_core::crd::{NodeSet, NodeSetSpec, NodeSetStatus, ObjectKey, ObjectReference, RequiredMetadata};
use slurm_core::slurm::{JobState, NoValNumber, NodeState, SlurmJob, SlurmNode, UpdateNodeMsg};
use slurm_core::{SlurmError, ANNOTATION_NODE_WEIGHT, ANNOTATION_POD_DELETE};

pub const NAMESPACE: &str = "hpc";
pub const CONTROLLER: &str = "slurm";
/// The template hash used for pods which are not up to date.
pub const STALE_HASH: &str = "stale";

/// The key of the Controller referenced by fixture NodeSets.
pub fn controller_key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, CONTROLLER)
}

//////////////////////////////////////////////////////////////////////////////
// Builders //////////////////////////////////////////////////////////////////

pub fn new_nodeset(name: &str) -> NodeSet {
    let mut nodeset = NodeSet::new(
        name,
        NodeSetSpec {
            controller_ref: ObjectReference {
                namespace: None,
                name: CONTROLLER.into(),
            },
            replicas: None,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(btreemap! {"app".to_string() => "slurmd".to_string()}),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "slurmd".into(),
                        image: Some("slurmd:25.05".into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            update_strategy: Default::default(),
            min_ready_seconds: 0,
        },
    );
    nodeset.metadata.namespace = Some(NAMESPACE.into());
    nodeset.metadata.uid = Some(format!("{}-uid", name));
    nodeset.metadata.generation = Some(1);
    nodeset
}

pub fn new_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: None,
    }
}

pub fn new_weighted_node(name: &str, weight: i32) -> Node {
    let mut node = new_node(name);
    node.metadata.annotations = Some(btreemap! {ANNOTATION_NODE_WEIGHT.to_string() => weight.to_string()});
    node
}

pub fn new_tainted_node(name: &str, key: &str, effect: &str) -> Node {
    let mut node = new_node(name);
    node.spec = Some(NodeSpec {
        taints: Some(vec![Taint {
            key: key.into(),
            effect: effect.into(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    node
}

pub fn new_nodes(names: &[&str]) -> Vec<Node> {
    names.iter().map(|name| new_node(name)).collect()
}

/// A running pod of the NodeSet on the given node, ready since the given time.
pub fn new_running_pod(nodeset: &NodeSet, node: &str, hash: &str, ready_since: DateTime<Utc>) -> Pod {
    let mut pod = pods::new_pod(nodeset, node, hash).expect("nodeset fixtures always carry a uid");
    pod.metadata.uid = Some(format!("{}-uid", pod.name()));
    pod.metadata.resource_version = Some("1".into());
    pod.metadata.creation_timestamp = Some(Time(ready_since));
    pod.status = Some(PodStatus {
        phase: Some("Running".into()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: "True".into(),
            last_transition_time: Some(Time(ready_since)),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

/// A running & available pod which is not up to date.
pub fn new_stale_pod(nodeset: &NodeSet, node: &str, ready_since: DateTime<Utc>) -> Pod {
    new_running_pod(nodeset, node, STALE_HASH, ready_since)
}

pub fn mark_for_deletion(pod: &mut Pod) {
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_POD_DELETE.into(), "true".into());
}

pub fn set_terminating(pod: &mut Pod, now: DateTime<Utc>) {
    pod.metadata.deletion_timestamp = Some(Time(now));
}

pub fn set_unready(pod: &mut Pod) {
    if let Some(status) = pod.status.as_mut() {
        status.conditions = Some(vec![PodCondition {
            type_: "Ready".into(),
            status: "False".into(),
            ..Default::default()
        }]);
    }
}

pub fn set_phase(pod: &mut Pod, phase: &str) {
    pod.status.get_or_insert_with(Default::default).phase = Some(phase.into());
}

/// Group the given pods by the node they are bound to.
pub fn pods_by_node(pods: Vec<Pod>) -> PodsByNode {
    let mut map = PodsByNode::new();
    for pod in pods {
        let node = pod_node_name(&pod).unwrap_or_default().to_string();
        map.entry(node).or_default().push(pod);
    }
    map
}

pub fn new_slurm_node(name: &str, states: &[NodeState]) -> SlurmNode {
    SlurmNode {
        name: name.into(),
        state: states.iter().copied().collect(),
        ..Default::default()
    }
}

pub fn new_running_job(job_id: i64, nodes: &str, start: DateTime<Utc>, limit_minutes: Option<i64>) -> SlurmJob {
    SlurmJob {
        job_id,
        job_state: vec![JobState::Running],
        nodes: nodes.into(),
        start_time: NoValNumber {
            set: true,
            infinite: false,
            number: start.timestamp(),
        },
        time_limit: NoValNumber {
            set: true,
            infinite: limit_minutes.is_none(),
            number: limit_minutes.unwrap_or_default(),
        },
    }
}

/// A client map holding the given fake under the fixture Controller's key.
pub fn client_map(slurm: Arc<FakeSlurm>) -> Arc<ClientMap> {
    let map = Arc::new(ClientMap::new());
    map.add(controller_key(), slurm);
    map
}

/// A NodeSet reconciler wired to in-memory fakes.
pub struct Harness {
    pub kube: Arc<FakeKube>,
    pub slurm: Arc<FakeSlurm>,
    pub resync: Arc<DurationStore>,
    pub reconciler: NodeSetReconciler,
}

impl Harness {
    /// Build a harness whose Slurm fake is registered under the fixture Controller.
    pub fn new(kube: FakeKube, slurm: FakeSlurm) -> Self {
        Self::build(kube, slurm, true)
    }

    /// Build a harness without any registered Slurm client.
    pub fn without_client(kube: FakeKube) -> Self {
        Self::build(kube, FakeSlurm::default(), false)
    }

    fn build(kube: FakeKube, slurm: FakeSlurm, register: bool) -> Self {
        let kube = Arc::new(kube);
        let slurm = Arc::new(slurm);
        let clients = if register { client_map(slurm.clone()) } else { Arc::new(ClientMap::new()) };
        let resync = Arc::new(DurationStore::new());
        let reconciler = NodeSetReconciler::new(kube.clone(), SlurmControl::new(clients), resync.clone());
        Self {
            kube,
            slurm,
            resync,
            reconciler,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// FakeSlurm /////////////////////////////////////////////////////////////////

/// An in-memory Slurm cluster.
#[derive(Default)]
pub struct FakeSlurm {
    pub nodes: Mutex<BTreeMap<String, SlurmNode>>,
    pub jobs: Mutex<Vec<SlurmJob>>,
    pub updates: Mutex<Vec<(String, UpdateNodeMsg)>>,
    pub deletes: Mutex<Vec<String>>,
    /// When set, every call fails with this error.
    pub failure: Mutex<Option<SlurmError>>,
}

impl FakeSlurm {
    pub fn with_nodes(nodes: Vec<SlurmNode>) -> Self {
        let fake = Self::default();
        *fake.nodes.lock().unwrap() = nodes.into_iter().map(|node| (node.name.clone(), node)).collect();
        fake
    }

    pub fn node(&self, name: &str) -> Option<SlurmNode> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn fail_with(&self, err: SlurmError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    fn check_failure(&self) -> Result<(), SlurmError> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SlurmClient for FakeSlurm {
    async fn get_node(&self, name: &str) -> Result<SlurmNode, SlurmError> {
        self.check_failure()?;
        self.node(name).ok_or(SlurmError::NotFound)
    }

    async fn list_nodes(&self, _opts: ListOptions) -> Result<Vec<SlurmNode>, SlurmError> {
        self.check_failure()?;
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn update_node(&self, name: &str, msg: &UpdateNodeMsg) -> Result<(), SlurmError> {
        self.check_failure()?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(name).ok_or(SlurmError::NotFound)?;
        if let Some(comment) = msg.comment.as_ref() {
            node.comment = comment.clone();
        }
        if let Some(reason) = msg.reason.as_ref() {
            node.reason = reason.clone();
        }
        for state in msg.state.iter().flatten() {
            match state {
                NodeState::Drain => {
                    node.state.0.insert(NodeState::Drain);
                    node.state.0.remove(&NodeState::Undrain);
                }
                NodeState::Undrain => {
                    node.state.0.remove(&NodeState::Drain);
                }
                NodeState::Idle => {
                    for base in NodeState::BASE {
                        node.state.0.remove(&base);
                    }
                    node.state.0.remove(&NodeState::NotResponding);
                    node.state.0.insert(NodeState::Idle);
                }
                other => {
                    node.state.0.insert(*other);
                }
            }
        }
        self.updates.lock().unwrap().push((name.to_string(), msg.clone()));
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), SlurmError> {
        self.check_failure()?;
        self.nodes.lock().unwrap().remove(name).ok_or(SlurmError::NotFound)?;
        self.deletes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<SlurmJob>, SlurmError> {
        self.check_failure()?;
        Ok(self.jobs.lock().unwrap().clone())
    }
}

//////////////////////////////////////////////////////////////////////////////
// FakeKube //////////////////////////////////////////////////////////////////

/// An in-memory Kubernetes API.
#[derive(Default)]
pub struct FakeKube {
    pub nodes: Mutex<Vec<Node>>,
    pub pods: Mutex<BTreeMap<ObjectKey, Pod>>,
    pub created: Mutex<Vec<String>>,
    pub replaced: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub condition_patches: Mutex<Vec<(String, Vec<PodCondition>)>>,
    pub status_writes: Mutex<Vec<NodeSetStatus>>,
    resource_version: AtomicU64,
}

impl FakeKube {
    pub fn new(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        let fake = Self::default();
        *fake.nodes.lock().unwrap() = nodes;
        *fake.pods.lock().unwrap() = pods.into_iter().map(|pod| (pod.key(), pod)).collect();
        fake
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(&ObjectKey::new(NAMESPACE, name)).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().map(|key| key.name.clone()).collect()
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 2).to_string()
    }
}

/// Check a pod against a simple `k=v,k=v` label selector.
fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .filter_map(|term| term.split_once('='))
        .all(|(key, val)| labels.get(key).map(String::as_str) == Some(val))
}

#[async_trait]
impl KubeOps for FakeKube {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| pod.namespace() == namespace && matches_selector(pod, selector))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods.lock().unwrap().get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let mut pods = self.pods.lock().unwrap();
        if let Some(existing) = pods.get(&pod.key()) {
            if pods::is_same_placement(existing, pod) {
                return Ok(());
            }
            bail!("pod {} already exists with a different owner or node", pod.key());
        }
        let mut pod = pod.clone();
        pod.metadata.uid = Some(format!("{}-uid", pod.name()));
        pod.metadata.resource_version = Some(self.next_version());
        pod.metadata.creation_timestamp = Some(Time(Utc::now()));
        pod.status = Some(PodStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        });
        self.created.lock().unwrap().push(pod.name().to_string());
        pods.insert(pod.key(), pod);
        Ok(())
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod> {
        let mut pods = self.pods.lock().unwrap();
        let stored = match pods.get_mut(&pod.key()) {
            Some(stored) => stored,
            None => bail!("pod {} not found", pod.key()),
        };
        if stored.metadata.resource_version != pod.metadata.resource_version {
            bail!("conflict replacing pod {}", pod.key());
        }
        let mut pod = pod.clone();
        pod.metadata.resource_version = Some(self.next_version());
        *stored = pod.clone();
        self.replaced.lock().unwrap().push(pod.name().to_string());
        Ok(pod)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        if self.pods.lock().unwrap().remove(&ObjectKey::new(namespace, name)).is_some() {
            self.deleted.lock().unwrap().push(name.to_string());
        }
        Ok(())
    }

    async fn patch_pod_conditions(&self, namespace: &str, name: &str, conditions: &[PodCondition]) -> Result<()> {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(&ObjectKey::new(namespace, name)) {
            let existing = pod.status.get_or_insert_with(Default::default).conditions.get_or_insert_with(Vec::new);
            for cond in conditions {
                existing.retain(|cur| cur.type_ != cond.type_);
                existing.push(cond.clone());
            }
        }
        self.condition_patches.lock().unwrap().push((name.to_string(), conditions.to_vec()));
        Ok(())
    }

    async fn update_nodeset_status(&self, _nodeset: &NodeSet, status: &NodeSetStatus) -> Result<()> {
        self.status_writes.lock().unwrap().push(status.clone());
        Ok(())
    }
}
