//! Workflow DAG advancement.
//!
//! A workflow job owns a graph of nodes, each launching at most one task. The
//! pass promotes pending workflows, marks branches that can no longer trigger
//! as do-not-run, spawns the nodes whose trigger edges fired, and concludes
//! workflows whose every node is decided. Approvals waiting past their
//! configured timeout are denied here as well, before the graphs are
//! evaluated, so the expiry is visible to the same pass.
//!
//! Node evaluation is edge-driven: a `success` edge fires when the parent's
//! job succeeded, a `failure` edge when it concluded in any failed state, and
//! an `always` edge on either. A node triggers as soon as one incoming edge
//! fires.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use windlass_jobs::{
    event_types, LaunchType, NodeTemplate, SchedulerEvent, Task, TaskKind, TaskStatus,
    WorkflowNode,
};

use crate::dependency_graph::DependencyGraph;
use crate::dispatch::ExecutionDispatcher;
use crate::locking::{NamedLock, WORKFLOW_MANAGER_LOCK};
use crate::sinks::{EventSink, NotificationOutcome, NotificationSink};
use crate::store::SchedulerStore;

use super::{emit, notify, SchedulerResult};

const MISSING_RESOURCE_EXPLANATION: &str = "Job spawned from workflow could not start because \
     it was missing a related resource such as project or inventory.";

const RECURSION_EXPLANATION: &str = "Workflow Job spawned from workflow could not start because \
     it would result in an infinite workflow recursion.";

const NO_ERROR_HANDLING_REASON: &str = "No error handling paths found, marking workflow as failed";

/// Counters for one workflow pass.
#[derive(Debug, Default, Clone)]
pub struct WorkflowStats {
    pub workflows_examined: i32,
    pub workflows_started: i32,
    pub workflows_finished: i32,
    pub nodes_spawned: i32,
    pub approvals_expired: i32,
    pub workflows_errored: i32,
}

impl WorkflowStats {
    /// Spawned or concluded work changes what the task manager would decide,
    /// so ask for a follow-up cycle.
    pub fn wants_reschedule(&self) -> bool {
        self.workflows_started > 0
            || self.workflows_finished > 0
            || self.nodes_spawned > 0
            || self.approvals_expired > 0
    }
}

/// Advances workflow jobs through their node graphs.
pub struct WorkflowManager {
    store: Arc<dyn SchedulerStore>,
    events: Arc<dyn EventSink>,
    notifications: Arc<dyn NotificationSink>,
    lock: Arc<dyn NamedLock>,
    dispatcher: Arc<dyn ExecutionDispatcher>,
}

impl WorkflowManager {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        events: Arc<dyn EventSink>,
        notifications: Arc<dyn NotificationSink>,
        lock: Arc<dyn NamedLock>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
    ) -> Self {
        Self {
            store,
            events,
            notifications,
            lock,
            dispatcher,
        }
    }

    /// Run one workflow pass. A no-op when another holder has the lock.
    #[instrument(skip(self))]
    pub async fn schedule(&self) -> SchedulerResult<WorkflowStats> {
        if !self.lock.try_acquire(WORKFLOW_MANAGER_LOCK).await? {
            debug!("Workflow manager lock held elsewhere, skipping pass");
            return Ok(WorkflowStats::default());
        }

        let result = self.run_pass().await;
        self.lock.release(WORKFLOW_MANAGER_LOCK).await?;
        result
    }

    async fn run_pass(&self) -> SchedulerResult<WorkflowStats> {
        let mut stats = WorkflowStats::default();
        let now = Utc::now();

        self.expire_approvals(now, &mut stats).await?;

        let active = self.store.active_tasks().await?;
        let mut graph = DependencyGraph::new();
        for task in active.iter().filter(|t| t.status == TaskStatus::Running) {
            graph.add_job(task);
        }

        let mut workflows: Vec<Task> = Vec::new();
        for task in &active {
            if !matches!(task.kind, TaskKind::WorkflowJob { .. }) {
                continue;
            }
            match task.status {
                TaskStatus::Pending => {
                    if let Some(blocker) = graph.task_blocked_by(task) {
                        debug!(
                            workflow = %task.log_format(),
                            blocker,
                            "Workflow blocked by a concurrent run of its template"
                        );
                        continue;
                    }
                    let mut workflow = task.clone();
                    workflow.status = TaskStatus::Running;
                    workflow.modified = now;
                    self.store.update_task(&workflow).await?;
                    emit(
                        self.events.as_ref(),
                        SchedulerEvent::status_change(
                            event_types::WORKFLOW_RUNNING,
                            workflow.id,
                            "running",
                        ),
                    )
                    .await;
                    info!(workflow = %workflow.log_format(), "Workflow started");
                    graph.add_job(&workflow);
                    stats.workflows_started += 1;
                    workflows.push(workflow);
                }
                TaskStatus::Running => workflows.push(task.clone()),
                _ => {}
            }
        }

        stats.workflows_examined = workflows.len() as i32;
        for workflow in &workflows {
            if let Err(e) = self.process_workflow(workflow, now, &mut stats).await {
                stats.workflows_errored += 1;
                warn!(workflow = %workflow.log_format(), error = %e, "Workflow processing failed");
            }
        }

        info!(
            workflows_examined = stats.workflows_examined,
            workflows_started = stats.workflows_started,
            workflows_finished = stats.workflows_finished,
            nodes_spawned = stats.nodes_spawned,
            approvals_expired = stats.approvals_expired,
            workflows_errored = stats.workflows_errored,
            "Workflow pass complete"
        );
        Ok(stats)
    }

    /// Deny approvals that have waited past their timeout. A zero timeout
    /// waits indefinitely.
    async fn expire_approvals(
        &self,
        now: DateTime<Utc>,
        stats: &mut WorkflowStats,
    ) -> SchedulerResult<()> {
        for approval in self.store.pending_approvals().await? {
            let TaskKind::WorkflowApproval { timeout_seconds } = approval.kind else {
                continue;
            };
            if timeout_seconds <= 0 {
                continue;
            }
            if now < approval.created + Duration::seconds(timeout_seconds) {
                continue;
            }

            let mut expired = approval;
            expired.status = TaskStatus::Failed;
            expired.finished = Some(now);
            expired.modified = now;
            expired.job_explanation = format!(
                "The approval node {} ({}) has expired after {} seconds.",
                expired.name, expired.id, timeout_seconds
            );
            self.store.update_task(&expired).await?;
            emit(
                self.events.as_ref(),
                SchedulerEvent::new(
                    event_types::APPROVAL_TIMED_OUT,
                    Some(expired.id),
                    serde_json::json!({ "timeout_seconds": timeout_seconds }),
                ),
            )
            .await;
            info!(
                approval = %expired.log_format(),
                timeout_seconds,
                "Approval expired without a verdict"
            );
            stats.approvals_expired += 1;
        }
        Ok(())
    }

    /// Advance one workflow: propagate dead branches, detect completion, spawn
    /// the nodes whose edges fired.
    async fn process_workflow(
        &self,
        workflow: &Task,
        now: DateTime<Utc>,
        stats: &mut WorkflowStats,
    ) -> SchedulerResult<()> {
        let mut nodes = self.store.workflow_nodes(workflow.id).await?;
        let job_ids: Vec<i64> = nodes.iter().filter_map(|n| n.job_id).collect();
        let jobs: BTreeMap<i64, Task> = self
            .store
            .tasks(&job_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        if workflow.cancel_flag {
            return self.cancel_workflow(workflow, &nodes, &jobs, now, stats).await;
        }

        let dead = nodes_to_mark_do_not_run(&nodes, &jobs);
        if !dead.is_empty() {
            self.store.mark_nodes_do_not_run(&dead).await?;
            debug!(
                workflow = %workflow.log_format(),
                nodes = ?dead,
                "Marked unreachable nodes do-not-run"
            );
            for node in &mut nodes {
                if dead.contains(&node.id) {
                    node.do_not_run = true;
                }
            }
        }

        if workflow_done(&nodes, &jobs) {
            return self.finish_workflow(workflow, &nodes, &jobs, now, stats).await;
        }

        let ready: Vec<WorkflowNode> = ready_nodes(&nodes, &jobs).into_iter().cloned().collect();
        for node in ready {
            self.spawn_node(workflow, &node, now, stats).await?;
        }
        Ok(())
    }

    /// Cooperative cancel: dead-end the untriggered graph, push cancellation
    /// down to spawned members, and conclude once every member has.
    async fn cancel_workflow(
        &self,
        workflow: &Task,
        nodes: &[WorkflowNode],
        jobs: &BTreeMap<i64, Task>,
        now: DateTime<Utc>,
        stats: &mut WorkflowStats,
    ) -> SchedulerResult<()> {
        let unstarted: Vec<i64> = nodes
            .iter()
            .filter(|n| !n.do_not_run && n.job_id.is_none())
            .map(|n| n.id)
            .collect();
        if !unstarted.is_empty() {
            self.store.mark_nodes_do_not_run(&unstarted).await?;
        }

        let mut all_concluded = true;
        for job in jobs.values() {
            match job.status {
                TaskStatus::New | TaskStatus::Pending | TaskStatus::Waiting => {
                    let mut member = job.clone();
                    member.status = TaskStatus::Canceled;
                    member.cancel_flag = true;
                    member.finished = Some(now);
                    member.modified = now;
                    self.store.update_task(&member).await?;
                    emit(
                        self.events.as_ref(),
                        SchedulerEvent::status_change(
                            event_types::TASK_CANCELED,
                            member.id,
                            "canceled",
                        ),
                    )
                    .await;
                    debug!(task = %member.log_format(), "Canceled workflow member before start");
                }
                TaskStatus::Running => {
                    if !job.cancel_flag {
                        let mut member = job.clone();
                        member.cancel_flag = true;
                        member.modified = now;
                        self.store.update_task(&member).await?;
                        // Placed members get a cancel request; nested workflows
                        // observe their own flag on the next pass.
                        if member.is_placed() {
                            if let Err(e) = self.dispatcher.cancel(&member).await {
                                warn!(task = %member.log_format(), error = %e, "Cancel request failed");
                            }
                        }
                    }
                    all_concluded = false;
                }
                _ => {}
            }
        }

        if all_concluded {
            let mut finished = workflow.clone();
            finished.status = TaskStatus::Canceled;
            finished.finished = Some(now);
            finished.modified = now;
            self.store.update_task(&finished).await?;
            emit(
                self.events.as_ref(),
                SchedulerEvent::status_change(
                    event_types::WORKFLOW_CANCELED,
                    finished.id,
                    "canceled",
                ),
            )
            .await;
            notify(
                self.notifications.as_ref(),
                &finished,
                NotificationOutcome::Canceled,
            )
            .await;
            info!(
                workflow = %finished.log_format(),
                "Workflow canceled, all spawned jobs have concluded"
            );
            stats.workflows_finished += 1;
        }
        Ok(())
    }

    async fn finish_workflow(
        &self,
        workflow: &Task,
        nodes: &[WorkflowNode],
        jobs: &BTreeMap<i64, Task>,
        now: DateTime<Utc>,
        stats: &mut WorkflowStats,
    ) -> SchedulerResult<()> {
        let mut finished = workflow.clone();
        finished.finished = Some(now);
        finished.modified = now;

        match workflow_failure_reason(nodes, jobs) {
            Some(reason) => {
                finished.status = TaskStatus::Failed;
                finished.job_explanation = reason.clone();
                self.store.update_task(&finished).await?;
                emit(
                    self.events.as_ref(),
                    SchedulerEvent::new(
                        event_types::WORKFLOW_FAILED,
                        Some(finished.id),
                        serde_json::json!({ "reason": reason }),
                    ),
                )
                .await;
                notify(
                    self.notifications.as_ref(),
                    &finished,
                    NotificationOutcome::Failed,
                )
                .await;
                info!(workflow = %finished.log_format(), "Workflow failed");
            }
            None => {
                finished.status = TaskStatus::Successful;
                self.store.update_task(&finished).await?;
                emit(
                    self.events.as_ref(),
                    SchedulerEvent::status_change(
                        event_types::WORKFLOW_SUCCESSFUL,
                        finished.id,
                        "successful",
                    ),
                )
                .await;
                notify(
                    self.notifications.as_ref(),
                    &finished,
                    NotificationOutcome::Succeeded,
                )
                .await;
                info!(workflow = %finished.log_format(), "Workflow completed successfully");
            }
        }
        stats.workflows_finished += 1;
        Ok(())
    }

    /// Create the task a ready node launches and link it to the node.
    async fn spawn_node(
        &self,
        workflow: &Task,
        node: &WorkflowNode,
        now: DateTime<Utc>,
        stats: &mut WorkflowStats,
    ) -> SchedulerResult<()> {
        let Some(template) = &node.template else {
            // Nothing to launch; the node resolves as a dead end so its
            // children settle instead of waiting forever.
            self.store.mark_nodes_do_not_run(&[node.id]).await?;
            debug!(
                workflow = %workflow.log_format(),
                node = node.id,
                "Node has no template, marked do-not-run"
            );
            return Ok(());
        };

        let mut task = task_from_template(template, workflow, now);

        if matches!(task.kind, TaskKind::PlaybookJob { .. }) && task.pre_start_check().is_err() {
            task.status = TaskStatus::Failed;
            task.finished = Some(now);
            task.job_explanation = MISSING_RESOURCE_EXPLANATION.to_string();
            warn!(
                workflow = %workflow.log_format(),
                node = node.id,
                "Node job is missing a related resource"
            );
        }

        if let NodeTemplate::WorkflowJobTemplate { id, .. } = template {
            if self.workflow_ancestry(workflow).await?.contains(id) {
                task.status = TaskStatus::Failed;
                task.finished = Some(now);
                task.job_explanation = RECURSION_EXPLANATION.to_string();
                info!(
                    workflow = %workflow.log_format(),
                    template = id,
                    "Refusing to start recursive nested workflow"
                );
            }
        }

        let task = self.store.insert_task(task).await?;
        self.store.set_node_job(node.id, task.id).await?;
        emit(
            self.events.as_ref(),
            SchedulerEvent::new(
                event_types::WORKFLOW_NODE_SPAWNED,
                Some(task.id),
                serde_json::json!({ "workflow_job_id": workflow.id, "node_id": node.id }),
            ),
        )
        .await;
        info!(
            workflow = %workflow.log_format(),
            node = node.id,
            task = %task.log_format(),
            "Spawned workflow node job"
        );
        stats.nodes_spawned += 1;
        Ok(())
    }

    /// Workflow-template ids along this workflow's spawning chain. Guards
    /// nested workflows against launching one of their own ancestors.
    async fn workflow_ancestry(&self, workflow: &Task) -> SchedulerResult<BTreeSet<i64>> {
        let mut chain = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut current = workflow.clone();
        loop {
            if !seen.insert(current.id) {
                break;
            }
            if let TaskKind::WorkflowJob {
                workflow_job_template_id: Some(template_id),
            } = current.kind
            {
                chain.insert(template_id);
            }
            let Some(parent_id) = current.workflow_job_id else {
                break;
            };
            match self.store.task(parent_id).await? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(chain)
    }
}

// =============================================================================
// Graph evaluation
// =============================================================================

/// Where one node stands in the DAG evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeResult {
    NotStarted,
    Active,
    Successful,
    Failed,
    DoNotRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Success,
    Failure,
    Always,
}

fn node_result(node: &WorkflowNode, jobs: &BTreeMap<i64, Task>) -> NodeResult {
    if node.do_not_run {
        return NodeResult::DoNotRun;
    }
    let Some(job_id) = node.job_id else {
        return NodeResult::NotStarted;
    };
    match jobs.get(&job_id).map(|job| job.status) {
        Some(TaskStatus::Successful) => NodeResult::Successful,
        Some(status) if status.is_failure() => NodeResult::Failed,
        Some(_) => NodeResult::Active,
        // A spawned job that no longer exists cannot satisfy any edge.
        None => NodeResult::Failed,
    }
}

fn edge_fires(result: NodeResult, edge: Edge) -> bool {
    matches!(
        (result, edge),
        (NodeResult::Successful, Edge::Success)
            | (NodeResult::Failed, Edge::Failure)
            | (NodeResult::Successful | NodeResult::Failed, Edge::Always)
    )
}

fn decided(result: NodeResult) -> bool {
    matches!(
        result,
        NodeResult::Successful | NodeResult::Failed | NodeResult::DoNotRun
    )
}

/// Incoming edges per node id.
fn parent_edges(nodes: &[WorkflowNode]) -> BTreeMap<i64, Vec<(i64, Edge)>> {
    let mut parents: BTreeMap<i64, Vec<(i64, Edge)>> = BTreeMap::new();
    for node in nodes {
        for child in &node.success_nodes {
            parents.entry(*child).or_default().push((node.id, Edge::Success));
        }
        for child in &node.failure_nodes {
            parents.entry(*child).or_default().push((node.id, Edge::Failure));
        }
        for child in &node.always_nodes {
            parents.entry(*child).or_default().push((node.id, Edge::Always));
        }
    }
    parents
}

/// Nodes whose trigger condition is met: roots not yet run, plus children
/// with at least one fired incoming edge.
fn ready_nodes<'a>(nodes: &'a [WorkflowNode], jobs: &BTreeMap<i64, Task>) -> Vec<&'a WorkflowNode> {
    let parents = parent_edges(nodes);
    let results: BTreeMap<i64, NodeResult> = nodes
        .iter()
        .map(|n| (n.id, node_result(n, jobs)))
        .collect();

    nodes
        .iter()
        .filter(|node| results[&node.id] == NodeResult::NotStarted)
        .filter(|node| match parents.get(&node.id) {
            None => true,
            Some(edges) => edges.iter().any(|(parent_id, edge)| {
                results
                    .get(parent_id)
                    .map_or(false, |r| edge_fires(*r, *edge))
            }),
        })
        .collect()
}

/// Nodes that can no longer trigger: every parent is decided and no incoming
/// edge fired. Cascades to a fixpoint since each newly dead node decides its
/// own children.
fn nodes_to_mark_do_not_run(nodes: &[WorkflowNode], jobs: &BTreeMap<i64, Task>) -> Vec<i64> {
    let parents = parent_edges(nodes);
    let mut results: BTreeMap<i64, NodeResult> = nodes
        .iter()
        .map(|n| (n.id, node_result(n, jobs)))
        .collect();
    let mut marked = Vec::new();

    loop {
        let mut changed = false;
        for node in nodes {
            if results[&node.id] != NodeResult::NotStarted {
                continue;
            }
            // Roots trigger unconditionally and are never dead-ended.
            let Some(edges) = parents.get(&node.id) else {
                continue;
            };
            let all_decided = edges
                .iter()
                .all(|(p, _)| results.get(p).map_or(false, |r| decided(*r)));
            let any_fired = edges
                .iter()
                .any(|(p, e)| results.get(p).map_or(false, |r| edge_fires(*r, *e)));
            if all_decided && !any_fired {
                results.insert(node.id, NodeResult::DoNotRun);
                marked.push(node.id);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    marked
}

/// The workflow concludes once every node is decided.
fn workflow_done(nodes: &[WorkflowNode], jobs: &BTreeMap<i64, Task>) -> bool {
    nodes.iter().all(|node| decided(node_result(node, jobs)))
}

/// A workflow fails when a member job failed on a node with no outgoing
/// failure or always edges to handle it.
fn workflow_failure_reason(nodes: &[WorkflowNode], jobs: &BTreeMap<i64, Task>) -> Option<String> {
    let unhandled = nodes.iter().any(|node| {
        node_result(node, jobs) == NodeResult::Failed
            && node.failure_nodes.is_empty()
            && node.always_nodes.is_empty()
    });
    unhandled.then(|| NO_ERROR_HANDLING_REASON.to_string())
}

/// Build the task a node template launches. Spawned tasks carry the workflow
/// launch type and a link back to their workflow job.
fn task_from_template(template: &NodeTemplate, workflow: &Task, now: DateTime<Utc>) -> Task {
    let kind = match template {
        NodeTemplate::JobTemplate {
            id,
            project_id,
            inventory_id,
            ..
        } => TaskKind::PlaybookJob {
            job_template_id: Some(*id),
            project_id: *project_id,
            inventory_id: *inventory_id,
        },
        NodeTemplate::Project { id, .. } => TaskKind::ProjectUpdate { project_id: *id },
        NodeTemplate::InventorySource { id, inventory_id, .. } => TaskKind::InventoryUpdate {
            inventory_source_id: *id,
            inventory_id: *inventory_id,
        },
        NodeTemplate::SystemJobTemplate { .. } => TaskKind::SystemJob,
        NodeTemplate::WorkflowJobTemplate { id, .. } => TaskKind::WorkflowJob {
            workflow_job_template_id: Some(*id),
        },
        NodeTemplate::ApprovalTemplate { timeout_seconds, .. } => TaskKind::WorkflowApproval {
            timeout_seconds: *timeout_seconds,
        },
    };

    let mut task = Task::new(template.name(), kind);
    task.status = TaskStatus::Pending;
    task.launch_type = LaunchType::Workflow;
    task.workflow_job_id = Some(workflow.id);
    task.created = now;
    task.modified = now;
    match template {
        NodeTemplate::JobTemplate {
            task_impact,
            allow_simultaneous,
            ..
        } => {
            task.task_impact = *task_impact;
            task.allow_simultaneous = *allow_simultaneous;
        }
        NodeTemplate::WorkflowJobTemplate {
            allow_simultaneous, ..
        } => {
            task.allow_simultaneous = *allow_simultaneous;
        }
        _ => {}
    }
    task
}
