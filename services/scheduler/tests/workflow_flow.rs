//! End-to-end workflow tests.
//!
//! Drive workflow jobs through promotion, node spawning, approvals, and
//! cancellation across full scheduling cycles, checking the member jobs the
//! task manager places along the way.

mod harness;

use harness::{job_template, node, seed_standard_cluster, workflow_job, Scheduler};
use chrono::{Duration, Utc};
use windlass_jobs::{event_types, LaunchType, NodeTemplate, TaskStatus};
use windlass_scheduler::sinks::NotificationOutcome;
use windlass_scheduler::store::SchedulerStore;

#[tokio::test]
async fn test_workflow_runs_chain_to_success() {
    let s = Scheduler::new();
    seed_standard_cluster(&s).await;
    let wf = s.store.add_task(workflow_job("release", 50)).await;
    let child = s.store.add_node(node(wf.id, Some(job_template(2)))).await;
    let mut root = node(wf.id, Some(job_template(1)));
    root.success_nodes = vec![child.id];
    s.store.add_node(root).await;

    // The first cycle promotes the workflow and spawns the root node's job.
    s.cycle().await;
    assert_eq!(s.status(wf.id).await, TaskStatus::Running);
    let nodes = s.store.workflow_nodes(wf.id).await.unwrap();
    let root = nodes.iter().find(|n| !n.success_nodes.is_empty()).unwrap();
    let first = root.job_id.expect("root node spawned a job");
    assert!(nodes
        .iter()
        .find(|n| n.success_nodes.is_empty())
        .unwrap()
        .job_id
        .is_none());

    let member = s.get(first).await;
    assert_eq!(member.status, TaskStatus::Pending);
    assert_eq!(member.launch_type, LaunchType::Workflow);
    assert_eq!(member.workflow_job_id, Some(wf.id));

    // Placement happens a cycle later, once dependencies are processed.
    s.cycle().await;
    assert_eq!(s.status(first).await, TaskStatus::Waiting);
    s.conclude(first, TaskStatus::Successful).await;

    // Success fires the edge into the child node.
    s.cycle().await;
    let nodes = s.store.workflow_nodes(wf.id).await.unwrap();
    let second = nodes
        .iter()
        .find(|n| n.success_nodes.is_empty())
        .unwrap()
        .job_id
        .expect("child node spawned a job");
    assert_eq!(s.status(second).await, TaskStatus::Pending);
    assert_eq!(s.status(wf.id).await, TaskStatus::Running);

    s.cycle().await;
    assert_eq!(s.status(second).await, TaskStatus::Waiting);
    s.conclude(second, TaskStatus::Successful).await;

    // Every node decided, so the workflow concludes.
    s.cycle().await;
    let finished = s.get(wf.id).await;
    assert_eq!(finished.status, TaskStatus::Successful);
    assert!(finished.finished.is_some());
    let types = s.events.event_types();
    assert!(types.contains(&event_types::WORKFLOW_NODE_SPAWNED.to_string()));
    assert!(types.contains(&event_types::WORKFLOW_SUCCESSFUL.to_string()));
    assert_eq!(
        s.notifications.sent(),
        vec![(wf.id, NotificationOutcome::Succeeded)]
    );
}

#[tokio::test]
async fn test_expired_approval_fails_workflow() {
    let s = Scheduler::new();
    seed_standard_cluster(&s).await;
    let wf = s.store.add_task(workflow_job("gated-release", 51)).await;
    s.store
        .add_node(node(
            wf.id,
            Some(NodeTemplate::ApprovalTemplate {
                id: 9,
                name: "gate".to_string(),
                timeout_seconds: 1,
            }),
        ))
        .await;

    s.cycle().await;
    let nodes = s.store.workflow_nodes(wf.id).await.unwrap();
    let approval_id = nodes[0].job_id.expect("approval spawned");
    assert_eq!(s.status(approval_id).await, TaskStatus::Pending);

    // Backdate the approval past its timeout instead of sleeping.
    let mut approval = s.get(approval_id).await;
    approval.created = Utc::now() - Duration::seconds(10);
    s.store.update_task(&approval).await.unwrap();

    s.cycle().await;

    let approval = s.get(approval_id).await;
    assert_eq!(approval.status, TaskStatus::Failed);
    assert!(approval.job_explanation.contains("has expired"));

    let finished = s.get(wf.id).await;
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(
        finished.job_explanation,
        "No error handling paths found, marking workflow as failed"
    );
    let types = s.events.event_types();
    assert!(types.contains(&event_types::APPROVAL_TIMED_OUT.to_string()));
    assert!(types.contains(&event_types::WORKFLOW_FAILED.to_string()));
    assert_eq!(
        s.notifications.sent(),
        vec![(wf.id, NotificationOutcome::Failed)]
    );
}

#[tokio::test]
async fn test_cancel_flag_unwinds_members() {
    let s = Scheduler::new();
    seed_standard_cluster(&s).await;
    let wf = s.store.add_task(workflow_job("doomed", 52)).await;
    s.store.add_node(node(wf.id, Some(job_template(1)))).await;

    s.cycle().await;
    s.cycle().await;
    let nodes = s.store.workflow_nodes(wf.id).await.unwrap();
    let member_id = nodes[0].job_id.expect("node spawned");
    assert_eq!(s.status(member_id).await, TaskStatus::Waiting);

    let mut flagged = s.get(wf.id).await;
    flagged.cancel_flag = true;
    s.store.update_task(&flagged).await.unwrap();

    // A member that never started running is canceled outright, and with no
    // running members left the workflow concludes in the same pass.
    s.cycle().await;
    let member = s.get(member_id).await;
    assert_eq!(member.status, TaskStatus::Canceled);
    assert!(member.finished.is_some());
    assert_eq!(s.status(wf.id).await, TaskStatus::Canceled);
    let types = s.events.event_types();
    assert!(types.contains(&event_types::TASK_CANCELED.to_string()));
    assert!(types.contains(&event_types::WORKFLOW_CANCELED.to_string()));
    assert_eq!(
        s.notifications.sent(),
        vec![(wf.id, NotificationOutcome::Canceled)]
    );
}

#[tokio::test]
async fn test_cancel_running_member_waits_for_conclusion() {
    let s = Scheduler::new();
    seed_standard_cluster(&s).await;
    let wf = s.store.add_task(workflow_job("long-haul", 53)).await;
    s.store.add_node(node(wf.id, Some(job_template(1)))).await;

    s.cycle().await;
    s.cycle().await;
    let nodes = s.store.workflow_nodes(wf.id).await.unwrap();
    let member_id = nodes[0].job_id.expect("node spawned");

    // The execution layer picks the member up.
    let mut member = s.get(member_id).await;
    member.status = TaskStatus::Running;
    s.store.update_task(&member).await.unwrap();

    let mut flagged = s.get(wf.id).await;
    flagged.cancel_flag = true;
    s.store.update_task(&flagged).await.unwrap();

    // A running member only gets a cancel request; the workflow stays open
    // until the execution layer reports the conclusion.
    s.cycle().await;
    let member = s.get(member_id).await;
    assert_eq!(member.status, TaskStatus::Running);
    assert!(member.cancel_flag);
    assert!(s.dispatcher.canceled().contains(&member_id));
    assert_eq!(s.status(wf.id).await, TaskStatus::Running);

    s.conclude(member_id, TaskStatus::Canceled).await;
    s.cycle().await;
    assert_eq!(s.status(wf.id).await, TaskStatus::Canceled);
}
