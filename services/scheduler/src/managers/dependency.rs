//! Dependency synthesis for pending tasks.
//!
//! Jobs that draw on source-controlled projects or refreshable inventories may
//! need those resources updated before they run. Each pass walks the pending
//! tasks whose dependencies have not been processed yet and, per resource,
//! either creates a synthetic update, attaches one already in flight, or lets
//! the task proceed with what it has.
//!
//! Synthetic updates are backdated relative to their parent task so the age
//! ordering used everywhere else schedules them first.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use windlass_jobs::{
    event_types, InventorySource, LaunchType, Project, SchedulerEvent, Task, TaskKind, TaskStatus,
};

use crate::locking::{NamedLock, DEPENDENCY_MANAGER_LOCK};
use crate::sinks::EventSink;
use crate::store::SchedulerStore;

use super::{emit, SchedulerResult};

/// Counters for one dependency pass.
#[derive(Debug, Default, Clone)]
pub struct DependencyStats {
    pub tasks_examined: i32,
    pub tasks_processed: i32,
    pub updates_created: i32,
    pub updates_attached: i32,
    pub tasks_errored: i32,
}

impl DependencyStats {
    /// A pass that processed anything warrants an immediate follow-up
    /// scheduling cycle so the new prerequisites get placed.
    pub fn wants_reschedule(&self) -> bool {
        self.tasks_processed > 0
    }
}

/// What to do about one prerequisite resource.
#[derive(Debug, PartialEq, Eq)]
enum PrerequisiteAction {
    /// Create a fresh synthetic update.
    Create,
    /// Wait on the update already in flight.
    Attach,
    /// The latest update is still fresh.
    Satisfied,
}

/// Creates prerequisite updates for tasks that need them.
pub struct DependencyManager {
    store: Arc<dyn SchedulerStore>,
    events: Arc<dyn EventSink>,
    lock: Arc<dyn NamedLock>,
}

impl DependencyManager {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        events: Arc<dyn EventSink>,
        lock: Arc<dyn NamedLock>,
    ) -> Self {
        Self {
            store,
            events,
            lock,
        }
    }

    /// Run one dependency pass. A no-op when another holder has the lock.
    #[instrument(skip(self))]
    pub async fn schedule(&self) -> SchedulerResult<DependencyStats> {
        if !self.lock.try_acquire(DEPENDENCY_MANAGER_LOCK).await? {
            debug!("Dependency manager lock held elsewhere, skipping pass");
            return Ok(DependencyStats::default());
        }

        let result = self.run_pass().await;
        self.lock.release(DEPENDENCY_MANAGER_LOCK).await?;
        result
    }

    async fn run_pass(&self) -> SchedulerResult<DependencyStats> {
        let mut stats = DependencyStats::default();
        let now = Utc::now();

        let tasks = self.store.pending_unprocessed_tasks().await?;
        stats.tasks_examined = tasks.len() as i32;

        let mut processed_ids = Vec::with_capacity(tasks.len());
        for task in &tasks {
            match self.process_task(task, now, &mut stats).await {
                // A task that errors keeps dependencies_processed=false and is
                // retried next pass.
                Ok(()) => processed_ids.push(task.id),
                Err(e) => {
                    stats.tasks_errored += 1;
                    warn!(task = %task.log_format(), error = %e, "Dependency processing failed");
                }
            }
        }

        if !processed_ids.is_empty() {
            self.store
                .mark_dependencies_processed(&processed_ids)
                .await?;
            stats.tasks_processed = processed_ids.len() as i32;
        }

        info!(
            tasks_examined = stats.tasks_examined,
            tasks_processed = stats.tasks_processed,
            updates_created = stats.updates_created,
            updates_attached = stats.updates_attached,
            tasks_errored = stats.tasks_errored,
            "Dependency pass complete"
        );
        Ok(stats)
    }

    /// Decide and record the prerequisite updates for one task.
    async fn process_task(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        stats: &mut DependencyStats,
    ) -> SchedulerResult<()> {
        let TaskKind::PlaybookJob {
            project_id,
            inventory_id,
            ..
        } = task.kind
        else {
            return Ok(());
        };

        // Tasks launched with prerequisites pre-attached keep them as-is.
        if !task.dependent_jobs.is_empty() {
            return Ok(());
        }

        let mut dependencies: Vec<Task> = Vec::new();

        if let Some(project_id) = project_id {
            if let Some(project) = self.store.project(project_id).await? {
                if project.scm_update_on_launch {
                    let latest = self.store.latest_project_update(project_id).await?;
                    match project_update_action(task, &project, latest.as_ref(), now) {
                        PrerequisiteAction::Create => {
                            let update = self
                                .store
                                .insert_task(project_update_task(task, &project))
                                .await?;
                            debug!(
                                task = %task.log_format(),
                                update = %update.log_format(),
                                "Created project update dependency"
                            );
                            dependencies.push(update);
                            stats.updates_created += 1;
                        }
                        PrerequisiteAction::Attach => {
                            if let Some(latest) = latest {
                                debug!(
                                    task = %task.log_format(),
                                    update = %latest.log_format(),
                                    "Attached in-flight project update"
                                );
                                dependencies.push(latest);
                                stats.updates_attached += 1;
                            }
                        }
                        PrerequisiteAction::Satisfied => {}
                    }
                }
            }
        }

        if let Some(inventory_id) = inventory_id {
            for source in self.store.inventory_sources(inventory_id).await? {
                if !source.update_on_launch {
                    continue;
                }
                let latest = self.store.latest_inventory_update(source.id).await?;
                match inventory_update_action(task, &source, latest.as_ref(), now) {
                    PrerequisiteAction::Create => {
                        let update = self
                            .store
                            .insert_task(inventory_update_task(task, &source))
                            .await?;
                        debug!(
                            task = %task.log_format(),
                            update = %update.log_format(),
                            "Created inventory update dependency"
                        );
                        dependencies.push(update);
                        stats.updates_created += 1;
                    }
                    PrerequisiteAction::Attach => {
                        if let Some(latest) = latest {
                            debug!(
                                task = %task.log_format(),
                                update = %latest.log_format(),
                                "Attached in-flight inventory update"
                            );
                            dependencies.push(latest);
                            stats.updates_attached += 1;
                        }
                    }
                    PrerequisiteAction::Satisfied => {}
                }
            }
        }

        if dependencies.is_empty() {
            return Ok(());
        }

        let dep_ids: Vec<i64> = dependencies.iter().map(|d| d.id).collect();
        let mut updated = task.clone();
        updated.dependent_jobs.extend(dep_ids.iter().copied());
        updated.modified = now;
        self.store.update_task(&updated).await?;

        emit(
            self.events.as_ref(),
            SchedulerEvent::new(
                event_types::DEPENDENCIES_CREATED,
                Some(task.id),
                serde_json::json!({ "dependencies": dep_ids }),
            ),
        )
        .await;

        info!(
            task = %task.log_format(),
            dependencies = ?dep_ids,
            "Generated prerequisite updates"
        );
        Ok(())
    }
}

/// Freshness decision for a task's project.
///
/// The zero-timeout guard keeps a task from waiting on a second sync right
/// after its own completed: that synthetic update was created exactly one
/// second before the task itself and is recognized by that timestamp.
fn project_update_action(
    task: &Task,
    project: &Project,
    latest: Option<&Task>,
    now: DateTime<Utc>,
) -> PrerequisiteAction {
    let Some(latest) = latest else {
        return PrerequisiteAction::Create;
    };
    if latest.status.is_failure() {
        return PrerequisiteAction::Create;
    }
    if latest.status.is_active() {
        return PrerequisiteAction::Attach;
    }
    if project.scm_update_cache_timeout == 0
        && latest.launch_type == LaunchType::Dependency
        && latest.created == task.created - Duration::seconds(1)
    {
        return PrerequisiteAction::Satisfied;
    }
    match latest.finished {
        Some(finished)
            if finished + Duration::seconds(project.scm_update_cache_timeout) >= now =>
        {
            PrerequisiteAction::Satisfied
        }
        _ => PrerequisiteAction::Create,
    }
}

/// Freshness decision for one inventory source. Only called for sources with
/// `update_on_launch` set. Carries the same zero-timeout guard as
/// [`project_update_action`], keyed on the two-second refresh backdate.
fn inventory_update_action(
    task: &Task,
    source: &InventorySource,
    latest: Option<&Task>,
    now: DateTime<Utc>,
) -> PrerequisiteAction {
    let Some(latest) = latest else {
        return PrerequisiteAction::Create;
    };
    if latest.status.is_active() {
        return PrerequisiteAction::Attach;
    }
    if latest.status.is_failure() {
        return PrerequisiteAction::Create;
    }
    if source.update_cache_timeout == 0
        && latest.launch_type == LaunchType::Dependency
        && latest.created == task.created - Duration::seconds(2)
    {
        return PrerequisiteAction::Satisfied;
    }
    match latest.finished {
        Some(finished)
            if finished + Duration::seconds(source.update_cache_timeout) >= now =>
        {
            PrerequisiteAction::Satisfied
        }
        _ => PrerequisiteAction::Create,
    }
}

/// Synthetic SCM sync for a task's project, backdated one second so age
/// ordering schedules it first.
fn project_update_task(task: &Task, project: &Project) -> Task {
    let mut update = Task::new(
        project.name.clone(),
        TaskKind::ProjectUpdate {
            project_id: project.id,
        },
    );
    update.status = TaskStatus::Pending;
    update.launch_type = LaunchType::Dependency;
    update.created = task.created - Duration::seconds(1);
    // Synthetic updates have no prerequisites of their own; born processed so
    // placement can start them this same cycle.
    update.dependencies_processed = true;
    update
}

/// Synthetic refresh for an inventory source, backdated two seconds so it
/// sorts ahead of both the task and any project sync created alongside it.
fn inventory_update_task(task: &Task, source: &InventorySource) -> Task {
    let mut update = Task::new(
        source.name.clone(),
        TaskKind::InventoryUpdate {
            inventory_source_id: source.id,
            inventory_id: source.inventory_id,
        },
    );
    update.status = TaskStatus::Pending;
    update.launch_type = LaunchType::Dependency;
    update.created = task.created - Duration::seconds(2);
    update.dependencies_processed = true;
    update
}
