use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};

use super::{prefixed_reason, SlurmControl};
use crate::clientmap::ClientMap;
use crate::fixtures::{self, new_running_job, new_running_pod, new_slurm_node, FakeSlurm};
use slurm_core::podinfo::PodInfo;
use slurm_core::slurm::{JobState, NodeState};
use slurm_core::SlurmError;

fn setup(nodes: Vec<slurm_core::slurm::SlurmNode>) -> (Arc<FakeSlurm>, SlurmControl) {
    let slurm = Arc::new(FakeSlurm::with_nodes(nodes));
    let control = SlurmControl::new(fixtures::client_map(slurm.clone()));
    (slurm, control)
}

#[tokio::test]
async fn operations_without_client_are_no_ops() -> Result<()> {
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());
    let control = SlurmControl::new(Arc::new(ClientMap::new()));

    control.make_node_drain(&nodeset, &pod, "maintenance").await?;
    control.update_node_with_pod_info(&nodeset, &pod).await?;
    assert!(control.is_node_drained(&nodeset, &pod).await?, "expected true without a client");
    assert!(control.is_node_drain(&nodeset, &pod).await?, "expected true without a client");
    assert!(control.list_nodes(&nodeset).await?.is_empty(), "expected no nodes without a client");
    let deadlines = control.get_node_deadlines(&nodeset, &[&pod]).await?;
    assert!(deadlines.is_empty(), "expected no deadlines without a client, got {:?}", deadlines);
    Ok(())
}

#[tokio::test]
async fn pod_info_update_is_idempotent() -> Result<()> {
    let (slurm, control) = setup(vec![new_slurm_node("gpu-a", &[NodeState::Idle])]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());

    control.update_node_with_pod_info(&nodeset, &pod).await?;
    control.update_node_with_pod_info(&nodeset, &pod).await?;
    assert!(slurm.update_count() == 1, "expected exactly one write, got {}", slurm.update_count());

    let comment = slurm.node("gpu-a").map(|node| node.comment).unwrap_or_default();
    let info: PodInfo = comment.parse()?;
    assert!(info.pod_name == "gpu-a" && info.node == "a", "unexpected pod info {:?}", info);
    Ok(())
}

#[tokio::test]
async fn pod_info_update_resets_migrated_nodes_to_idle() -> Result<()> {
    let mut node = new_slurm_node("gpu-a", &[NodeState::Down, NodeState::NotResponding]);
    node.comment = PodInfo {
        namespace: fixtures::NAMESPACE.into(),
        pod_name: "gpu-a".into(),
        node: "old-node".into(),
    }
    .to_string();
    let (slurm, control) = setup(vec![node]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());

    control.update_node_with_pod_info(&nodeset, &pod).await?;
    let updates = slurm.updates.lock().unwrap().clone();
    assert!(updates.len() == 2, "expected identity write & state reset, got {:?}", updates);
    assert!(
        updates[1].1.state == Some(vec![NodeState::Idle]),
        "expected node to be forced to IDLE, got {:?}",
        updates[1].1
    );
    Ok(())
}

#[tokio::test]
async fn drain_and_undrain_skip_redundant_writes() -> Result<()> {
    let (slurm, control) = setup(vec![new_slurm_node("gpu-a", &[NodeState::Allocated])]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());

    control.make_node_undrain(&nodeset, &pod, "healthy").await?;
    assert!(slurm.update_count() == 0, "expected undrain of a node which is not drain to be skipped");

    control.make_node_drain(&nodeset, &pod, "maintenance").await?;
    control.make_node_drain(&nodeset, &pod, "maintenance").await?;
    assert!(slurm.update_count() == 1, "expected a single drain write, got {}", slurm.update_count());

    let node = slurm.node("gpu-a").unwrap_or_default();
    assert!(node.reason == prefixed_reason("maintenance"), "expected prefixed reason, got {:?}", node.reason);
    assert!(control.is_node_drain(&nodeset, &pod).await?, "expected node to be drain");
    assert!(!control.is_node_drained(&nodeset, &pod).await?, "expected allocated node not to be drained");
    assert!(control.is_node_reason_ours(&nodeset, &pod).await?, "expected operator reason to be ours");

    control.make_node_undrain(&nodeset, &pod, "healthy").await?;
    assert!(!control.is_node_drain(&nodeset, &pod).await?, "expected node to be undrained");
    Ok(())
}

#[tokio::test]
async fn foreign_reasons_are_not_ours() -> Result<()> {
    let mut node = new_slurm_node("gpu-a", &[NodeState::Idle, NodeState::Drain]);
    node.reason = "bad dimm".into();
    let (_slurm, control) = setup(vec![node]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());

    assert!(!control.is_node_reason_ours(&nodeset, &pod).await?, "expected admin reason not to be ours");
    assert!(prefixed_reason("").is_empty(), "expected empty reasons to stay empty");
    Ok(())
}

#[tokio::test]
async fn unresponsive_nodes_are_detected_by_reason() -> Result<()> {
    let mut node = new_slurm_node("gpu-a", &[NodeState::Down, NodeState::NotResponding]);
    node.reason = "Not responding".into();
    let (_slurm, control) = setup(vec![node]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());

    assert!(control.is_node_down_for_unresponsive(&nodeset, &pod).await?, "expected node to be down for unresponsive");
    Ok(())
}

#[tokio::test]
async fn missing_nodes_are_tolerated_but_transport_errors_are_not() -> Result<()> {
    let (slurm, control) = setup(vec![]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "a", "h", Utc::now());

    control.make_node_drain(&nodeset, &pod, "maintenance").await?;
    assert!(control.is_node_drained(&nodeset, &pod).await?, "expected missing node to count as drained");

    slurm.fail_with(SlurmError::Transport("connection refused".into()));
    let res = control.is_node_drained(&nodeset, &pod).await;
    assert!(res.is_err(), "expected transport errors to be surfaced");
    Ok(())
}

#[tokio::test]
async fn node_deadlines_track_latest_running_job() -> Result<()> {
    let (slurm, control) = setup(vec![]);
    let nodeset = fixtures::new_nodeset("gpu");
    let pod = new_running_pod(&nodeset, "1", "h", Utc::now());
    let start = Utc::now();

    let mut pending = new_running_job(4, "gpu-1", start, Some(600));
    pending.job_state = vec![JobState::Pending];
    *slurm.jobs.lock().unwrap() = vec![
        new_running_job(1, "gpu-[1-2]", start, Some(10)),
        new_running_job(2, "gpu-1", start, Some(60)),
        new_running_job(3, "cpu-[1-4]", start, Some(600)),
        pending,
    ];

    let deadlines = control.get_node_deadlines(&nodeset, &[&pod]).await?;
    let expected_a = start + Duration::minutes(60);
    let expected_b = start + Duration::minutes(10);
    assert!(
        deadlines.get("gpu-1").map(|d| d.timestamp()) == Some(expected_a.timestamp()),
        "expected gpu-1 deadline {}, got {:?}",
        expected_a,
        deadlines.get("gpu-1")
    );
    assert!(
        deadlines.get("gpu-2").map(|d| d.timestamp()) == Some(expected_b.timestamp()),
        "expected gpu-2 deadline {}, got {:?}",
        expected_b,
        deadlines.get("gpu-2")
    );
    assert!(deadlines.get("cpu-1").is_none(), "expected unrelated jobs to be skipped");

    slurm.jobs.lock().unwrap().push(new_running_job(5, "gpu-[2-1]", start, None));
    let res = control.get_node_deadlines(&nodeset, &[&pod]).await;
    assert!(res.is_err(), "expected an invalid hostlist to be an error");
    Ok(())
}
