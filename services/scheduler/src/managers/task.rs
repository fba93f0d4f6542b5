//! Task placement and dispatch.
//!
//! The core scheduling pass. Each cycle rebuilds capacity and blocking state
//! from the tasks already started, reaps tasks stranded on instances that have
//! left the cluster, then walks pending tasks oldest-first and starts every
//! task that is unblocked and has room somewhere in its preferred groups.
//!
//! Capacity is cycle-local bookkeeping. A task that cannot start stays
//! pending and is reconsidered from scratch on the next pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use windlass_jobs::{event_types, CapacityType, Instance, NodeType, SchedulerEvent, Task, TaskStatus};

use crate::capacity::CapacityModel;
use crate::config::SchedulerConfig;
use crate::dependency_graph::DependencyGraph;
use crate::dispatch::ExecutionDispatcher;
use crate::locking::{NamedLock, TASK_MANAGER_LOCK};
use crate::sinks::{EventSink, NotificationOutcome, NotificationSink};
use crate::store::SchedulerStore;

use super::{emit, notify, SchedulerResult};

const REAPED_EXPLANATION: &str = "Task was marked as running but its execution node \
     was not present in the instance registry, so it has been marked as failed.";

const NOT_ENOUGH_CAPACITY_EXPLANATION: &str =
    "This job is not ready to start because there is not enough available capacity.";

const PRE_START_FAILED_EXPLANATION: &str = "Task failed pre-start check.";

/// Counters for one task-manager pass.
#[derive(Debug, Default, Clone)]
pub struct TaskManagerStats {
    pub tasks_examined: i32,
    pub tasks_started: i32,
    pub tasks_blocked: i32,
    pub tasks_failed: i32,
    pub tasks_needing_capacity: i32,
    pub tasks_reaped: i32,
    pub tasks_errored: i32,
    pub start_limit_reached: bool,
    pub deadline_reached: bool,
}

impl TaskManagerStats {
    /// A pass cut short by the start limit or the deadline left startable
    /// work behind; run another cycle promptly instead of waiting out the
    /// full interval.
    pub fn wants_reschedule(&self) -> bool {
        self.start_limit_reached || self.deadline_reached
    }
}

/// Outcome of the blocked checks for one pending task.
enum BlockResult {
    Clear,
    Blocked(Task),
    /// The task was failed in place because a dependency concluded in failure.
    FailedDependency,
}

/// Places unblocked pending tasks onto instances and hands them to the
/// dispatcher.
pub struct TaskManager {
    store: Arc<dyn SchedulerStore>,
    events: Arc<dyn EventSink>,
    notifications: Arc<dyn NotificationSink>,
    lock: Arc<dyn NamedLock>,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    config: SchedulerConfig,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        events: Arc<dyn EventSink>,
        notifications: Arc<dyn NotificationSink>,
        lock: Arc<dyn NamedLock>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            events,
            notifications,
            lock,
            dispatcher,
            config,
        }
    }

    /// Run one placement pass. A no-op when another holder has the lock.
    #[instrument(skip(self))]
    pub async fn schedule(&self) -> SchedulerResult<TaskManagerStats> {
        if !self.lock.try_acquire(TASK_MANAGER_LOCK).await? {
            debug!("Task manager lock held elsewhere, skipping pass");
            return Ok(TaskManagerStats::default());
        }

        let result = self.run_pass().await;
        self.lock.release(TASK_MANAGER_LOCK).await?;
        result
    }

    async fn run_pass(&self) -> SchedulerResult<TaskManagerStats> {
        let pass_started = Instant::now();
        let mut stats = TaskManagerStats::default();
        let now = Utc::now();

        let instances = self.store.enabled_instances().await?;
        let groups = self.store.instance_groups().await?;
        let active = self.store.active_tasks().await?;
        let active = self.reap_orphans(active, &instances, now, &mut stats).await?;

        let started: Vec<Task> = active
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Waiting))
            .cloned()
            .collect();
        let mut capacity = CapacityModel::build(
            &instances,
            &groups,
            &started,
            self.config.control_task_impact,
        );
        let mut graph = DependencyGraph::new();
        for task in &started {
            graph.add_job(task);
        }

        let pending: Vec<Task> = active
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        let context = self.load_context(&active, &pending).await?;

        let mut remaining_starts = self.config.start_task_limit;
        for task in &pending {
            if remaining_starts == 0 {
                info!("Start limit reached, deferring remaining pending tasks to a follow-up cycle");
                stats.start_limit_reached = true;
                break;
            }
            if pass_started.elapsed() > self.config.cycle_deadline {
                warn!(
                    elapsed_secs = pass_started.elapsed().as_secs(),
                    "Cycle deadline reached while pending tasks remain, exiting loop early"
                );
                stats.deadline_reached = true;
                break;
            }
            stats.tasks_examined += 1;

            // Still waiting on the dependency manager.
            if !task.dependencies_processed {
                continue;
            }
            // Workflow jobs run in the workflow manager, not on an instance.
            if !task.is_placed() {
                continue;
            }

            match self
                .evaluate_pending(task, &mut capacity, &mut graph, &context, now, &mut stats)
                .await
            {
                Ok(true) => remaining_starts -= 1,
                Ok(false) => {}
                Err(e) => {
                    stats.tasks_errored += 1;
                    warn!(task = %task.log_format(), error = %e, "Task evaluation failed");
                }
            }
        }

        info!(
            tasks_examined = stats.tasks_examined,
            tasks_started = stats.tasks_started,
            tasks_blocked = stats.tasks_blocked,
            tasks_failed = stats.tasks_failed,
            tasks_needing_capacity = stats.tasks_needing_capacity,
            tasks_reaped = stats.tasks_reaped,
            tasks_errored = stats.tasks_errored,
            "Task manager pass complete"
        );
        Ok(stats)
    }

    /// Force-fail started tasks whose execution node has left the registry.
    /// Tasks without an execution node (container groups, not-yet-placed work)
    /// are never reaped. Returns the surviving tasks.
    async fn reap_orphans(
        &self,
        tasks: Vec<Task>,
        instances: &[Instance],
        now: DateTime<Utc>,
        stats: &mut TaskManagerStats,
    ) -> SchedulerResult<Vec<Task>> {
        let known: BTreeSet<&str> = instances.iter().map(|i| i.hostname.as_str()).collect();

        let mut survivors = Vec::with_capacity(tasks.len());
        for task in tasks {
            let orphaned = matches!(task.status, TaskStatus::Running | TaskStatus::Waiting)
                && task
                    .execution_node
                    .as_deref()
                    .map_or(false, |node| !known.contains(node));
            if !orphaned {
                survivors.push(task);
                continue;
            }

            let mut reaped = task;
            reaped.status = TaskStatus::Failed;
            reaped.finished = Some(now);
            reaped.modified = now;
            reaped.job_explanation = REAPED_EXPLANATION.to_string();
            self.store.update_task(&reaped).await?;
            emit(
                self.events.as_ref(),
                SchedulerEvent::status_change(event_types::TASK_REAPED, reaped.id, "failed"),
            )
            .await;
            notify(
                self.notifications.as_ref(),
                &reaped,
                NotificationOutcome::Failed,
            )
            .await;
            warn!(
                task = %reaped.log_format(),
                execution_node = reaped.execution_node.as_deref().unwrap_or(""),
                "Reaped task whose execution node is gone"
            );
            stats.tasks_reaped += 1;
        }
        Ok(survivors)
    }

    /// Tasks the blocked checks may reference: every active task plus any
    /// named dependency that already concluded.
    async fn load_context(
        &self,
        active: &[Task],
        pending: &[Task],
    ) -> SchedulerResult<BTreeMap<i64, Task>> {
        let mut context: BTreeMap<i64, Task> =
            active.iter().map(|t| (t.id, t.clone())).collect();

        let missing: Vec<i64> = pending
            .iter()
            .flat_map(|t| t.dependent_jobs.iter().copied())
            .filter(|id| !context.contains_key(id))
            .collect::<BTreeSet<i64>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            for dep in self.store.tasks(&missing).await? {
                context.insert(dep.id, dep);
            }
        }
        Ok(context)
    }

    /// Evaluate one pending task: blocked checks first, then placement.
    /// Returns true when the task went through the start path, whether it
    /// came out waiting or failed pre-start.
    async fn evaluate_pending(
        &self,
        task: &Task,
        capacity: &mut CapacityModel,
        graph: &mut DependencyGraph,
        context: &BTreeMap<i64, Task>,
        now: DateTime<Utc>,
        stats: &mut TaskManagerStats,
    ) -> SchedulerResult<bool> {
        match self.blocked_state(task, graph, context, now, stats).await? {
            BlockResult::FailedDependency => return Ok(false),
            BlockResult::Blocked(blocker) => {
                debug!(
                    task = %task.log_format(),
                    blocked_by = %blocker.log_format(),
                    "Task is blocked"
                );
                stats.tasks_blocked += 1;
                self.annotate_pending(task, format!("waiting for {} to finish", blocker.log_format()), now)
                    .await?;
                return Ok(false);
            }
            BlockResult::Clear => {}
        }

        if self.try_place(task, capacity, graph, now, stats).await? {
            return Ok(true);
        }

        debug!(task = %task.log_format(), "Not enough capacity to start task");
        stats.tasks_needing_capacity += 1;
        self.annotate_pending(task, NOT_ENOUGH_CAPACITY_EXPLANATION.to_string(), now)
            .await?;
        Ok(false)
    }

    /// Graph conflicts and unresolved dependencies. A dependency that
    /// concluded in failure fails the task right here so it never reaches
    /// the start path; a canceled dependency does not count against it.
    async fn blocked_state(
        &self,
        task: &Task,
        graph: &DependencyGraph,
        context: &BTreeMap<i64, Task>,
        now: DateTime<Utc>,
        stats: &mut TaskManagerStats,
    ) -> SchedulerResult<BlockResult> {
        if let Some(blocker_id) = graph.task_blocked_by(task) {
            if let Some(blocker) = context.get(&blocker_id) {
                return Ok(BlockResult::Blocked(blocker.clone()));
            }
        }

        for dep_id in &task.dependent_jobs {
            let Some(dep) = context.get(dep_id) else {
                continue;
            };
            if dep.status.is_active() {
                return Ok(BlockResult::Blocked(dep.clone()));
            }
            if matches!(dep.status, TaskStatus::Failed | TaskStatus::Error) {
                let mut failed = task.clone();
                failed.status = TaskStatus::Failed;
                failed.finished = Some(now);
                failed.modified = now;
                failed.job_explanation = format!(
                    r#"Previous Task Failed: {{"job_type": "{}", "job_name": "{}", "job_id": "{}"}}"#,
                    dep.kind.label(),
                    dep.name,
                    dep.id
                );
                self.store.update_task(&failed).await?;
                emit(
                    self.events.as_ref(),
                    SchedulerEvent::status_change(event_types::TASK_FAILED, failed.id, "failed"),
                )
                .await;
                notify(
                    self.notifications.as_ref(),
                    &failed,
                    NotificationOutcome::Failed,
                )
                .await;
                info!(
                    task = %failed.log_format(),
                    dependency = %dep.log_format(),
                    "Task failed because a dependency concluded in failure"
                );
                stats.tasks_failed += 1;
                return Ok(BlockResult::FailedDependency);
            }
        }
        Ok(BlockResult::Clear)
    }

    /// Find a home for the task in its preferred groups and start it there.
    /// Returns false when nothing had room.
    async fn try_place(
        &self,
        task: &Task,
        capacity: &mut CapacityModel,
        graph: &mut DependencyGraph,
        now: DateTime<Utc>,
        stats: &mut TaskManagerStats,
    ) -> SchedulerResult<bool> {
        // Control-plane tasks run on the node that controls them.
        if task.capacity_type() == CapacityType::Control {
            let impact = task.effective_impact() + self.config.control_task_impact;
            let group = self.config.control_plane_group.clone();
            let Some(node) =
                capacity.best_fit_instance(&group, impact, CapacityType::Control, false)
            else {
                return Ok(false);
            };
            if self
                .start_task(task, group, Some(node.clone()), Some(node.clone()), graph, now, stats)
                .await?
            {
                capacity.consume(&node, impact);
            }
            return Ok(true);
        }

        // Execution tasks also need a controller; probe for one up front.
        let controller = capacity.best_fit_instance(
            &self.config.control_plane_group,
            self.config.control_task_impact,
            CapacityType::Control,
            false,
        );

        let preferred = if task.preferred_instance_groups.is_empty() {
            vec![self.config.default_execution_group.clone()]
        } else {
            task.preferred_instance_groups.clone()
        };

        for group in &preferred {
            // Container groups execute elsewhere and bypass instance capacity
            // accounting entirely.
            if capacity.is_container_group(group) {
                self.start_task(task, group.clone(), None, None, graph, now, stats)
                    .await?;
                return Ok(true);
            }

            let Some(controller) = controller.as_deref() else {
                debug!(
                    task = %task.log_format(),
                    "Not enough control plane capacity left to control new tasks"
                );
                continue;
            };

            let impact = task.effective_impact();
            let execution_node = capacity
                .best_fit_instance(group, impact, CapacityType::Execution, true)
                .or_else(|| capacity.largest_idle_instance(group, CapacityType::Execution));
            let Some(execution_node) = execution_node else {
                debug!(
                    task = %task.log_format(),
                    group = %group,
                    impact,
                    "No instance in group has capacity for task"
                );
                continue;
            };

            // A hybrid instance controls the tasks it runs itself.
            if capacity.node_type(&execution_node) == Some(NodeType::Hybrid) {
                if self
                    .start_task(
                        task,
                        group.clone(),
                        Some(execution_node.clone()),
                        Some(execution_node.clone()),
                        graph,
                        now,
                        stats,
                    )
                    .await?
                {
                    capacity.consume(&execution_node, impact + self.config.control_task_impact);
                }
            } else if self
                .start_task(
                    task,
                    group.clone(),
                    Some(execution_node.clone()),
                    Some(controller.to_string()),
                    graph,
                    now,
                    stats,
                )
                .await?
            {
                capacity.consume(controller, self.config.control_task_impact);
                capacity.consume(&execution_node, impact);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Transition a task to waiting on its chosen placement and hand it to
    /// the dispatcher. Failing the pre-start check fails the task instead;
    /// the caller only charges capacity on a true return.
    async fn start_task(
        &self,
        task: &Task,
        group: String,
        execution_node: Option<String>,
        controller_node: Option<String>,
        graph: &mut DependencyGraph,
        now: DateTime<Utc>,
        stats: &mut TaskManagerStats,
    ) -> SchedulerResult<bool> {
        let mut started = task.clone();

        if let Err(reason) = started.pre_start_check() {
            debug!(task = %started.log_format(), reason = %reason, "Task failed pre-start check");
            started.status = TaskStatus::Failed;
            started.finished = Some(now);
            started.modified = now;
            if !started.job_explanation.is_empty() {
                started.job_explanation.push(' ');
            }
            started.job_explanation.push_str(PRE_START_FAILED_EXPLANATION);
            self.store.update_task(&started).await?;
            emit(
                self.events.as_ref(),
                SchedulerEvent::status_change(event_types::TASK_FAILED, started.id, "failed"),
            )
            .await;
            stats.tasks_failed += 1;
            return Ok(false);
        }

        started.status = TaskStatus::Waiting;
        started.instance_group = Some(group);
        started.execution_node = execution_node;
        started.controller_node = controller_node;
        started.modified = now;
        self.store.update_task(&started).await?;
        emit(
            self.events.as_ref(),
            SchedulerEvent::status_change(event_types::TASK_WAITING, started.id, "waiting"),
        )
        .await;

        info!(
            task = %started.log_format(),
            instance_group = started.instance_group.as_deref().unwrap_or(""),
            execution_node = started.execution_node.as_deref().unwrap_or(""),
            controller_node = started.controller_node.as_deref().unwrap_or(""),
            "Submitting task to the dispatcher"
        );
        if let Err(e) = self.dispatcher.dispatch(&started).await {
            // The task stays waiting; recovering stuck waiting tasks is the
            // execution layer's responsibility.
            warn!(task = %started.log_format(), error = %e, "Dispatch failed");
        }

        // Register so later tasks in this pass see the conflict.
        graph.add_job(&started);
        stats.tasks_started += 1;
        Ok(true)
    }

    /// Record why a task is not starting, but only once it has been pending
    /// longer than the grace period. Most tasks start within a cycle or two;
    /// the grace keeps short-lived pending states from churning writes.
    async fn annotate_pending(
        &self,
        task: &Task,
        explanation: String,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let grace = Duration::seconds(self.config.job_explanation_grace.as_secs() as i64);
        if task.created >= now - grace {
            return Ok(());
        }
        if task.job_explanation == explanation {
            return Ok(());
        }

        let mut annotated = task.clone();
        annotated.job_explanation = explanation;
        annotated.modified = now;
        self.store.update_task(&annotated).await?;
        Ok(())
    }
}
