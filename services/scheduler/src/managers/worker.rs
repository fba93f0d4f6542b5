//! Scheduler background worker.
//!
//! Runs the three manager passes as one reconciliation cycle on a periodic
//! interval. A cycle that leaves startable work behind requests an immediate
//! follow-up cycle instead of waiting out the full interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{error, info, instrument};

use super::{DependencyManager, TaskManager, WorkflowManager};

/// Cumulative counters across every cycle this worker has run, flushed once
/// at shutdown.
#[derive(Debug, Default, Clone)]
pub struct SchedulerMetrics {
    pub cycles: i64,
    pub updates_created: i64,
    pub workflows_finished: i64,
    pub approvals_expired: i64,
    pub tasks_started: i64,
    pub tasks_failed: i64,
    pub tasks_reaped: i64,
}

/// Background worker driving scheduling cycles.
pub struct SchedulerWorker {
    dependency: DependencyManager,
    workflow: WorkflowManager,
    task: TaskManager,
    interval: Duration,
    reschedule: Arc<Notify>,
    metrics: SchedulerMetrics,
}

impl SchedulerWorker {
    pub fn new(
        dependency: DependencyManager,
        workflow: WorkflowManager,
        task: TaskManager,
        interval: Duration,
    ) -> Self {
        Self {
            dependency,
            workflow,
            task,
            interval,
            reschedule: Arc::new(Notify::new()),
            metrics: SchedulerMetrics::default(),
        }
    }

    /// Handle for other components to request an immediate cycle, for example
    /// an API frontend that just enqueued a task.
    pub fn reschedule_handle(&self) -> Arc<Notify> {
        self.reschedule.clone()
    }

    /// Run scheduling cycles until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;
        let reschedule = self.reschedule.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = reschedule.notified() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            cycles = self.metrics.cycles,
                            updates_created = self.metrics.updates_created,
                            workflows_finished = self.metrics.workflows_finished,
                            approvals_expired = self.metrics.approvals_expired,
                            tasks_started = self.metrics.tasks_started,
                            tasks_failed = self.metrics.tasks_failed,
                            tasks_reaped = self.metrics.tasks_reaped,
                            "Scheduler worker shutting down"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// One full cycle: dependencies, then workflows, then task placement.
    /// A failing pass is logged and the cycle moves on; the next pass gets a
    /// fresh view of the world anyway.
    async fn run_cycle(&mut self) {
        self.metrics.cycles += 1;
        let mut follow_up = false;

        match self.dependency.schedule().await {
            Ok(stats) => {
                follow_up |= stats.wants_reschedule();
                self.metrics.updates_created += i64::from(stats.updates_created);
            }
            Err(e) => error!(error = %e, "Dependency manager pass failed"),
        }

        match self.workflow.schedule().await {
            Ok(stats) => {
                follow_up |= stats.wants_reschedule();
                self.metrics.workflows_finished += i64::from(stats.workflows_finished);
                self.metrics.approvals_expired += i64::from(stats.approvals_expired);
            }
            Err(e) => error!(error = %e, "Workflow manager pass failed"),
        }

        match self.task.schedule().await {
            Ok(stats) => {
                follow_up |= stats.wants_reschedule();
                self.metrics.tasks_started += i64::from(stats.tasks_started);
                self.metrics.tasks_failed += i64::from(stats.tasks_failed);
                self.metrics.tasks_reaped += i64::from(stats.tasks_reaped);
            }
            Err(e) => error!(error = %e, "Task manager pass failed"),
        }

        if follow_up {
            self.reschedule.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use windlass_jobs::{Instance, InstanceGroup, NodeType, Task, TaskKind, TaskStatus};

    use crate::config::SchedulerConfig;
    use crate::dispatch::MockDispatcher;
    use crate::locking::LocalLock;
    use crate::sinks::{MemoryEventSink, MemoryNotificationSink};
    use crate::store::{MemoryStore, SchedulerStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        worker: SchedulerWorker,
    }

    fn fixture(interval: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let notifications = Arc::new(MemoryNotificationSink::new());
        let lock = Arc::new(LocalLock::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        let worker = SchedulerWorker::new(
            DependencyManager::new(store.clone(), events.clone(), lock.clone()),
            WorkflowManager::new(
                store.clone(),
                events.clone(),
                notifications.clone(),
                lock.clone(),
                dispatcher.clone(),
            ),
            TaskManager::new(
                store.clone(),
                events.clone(),
                notifications,
                lock.clone(),
                dispatcher.clone(),
                SchedulerConfig::default(),
            ),
            interval,
        );
        Fixture { store, worker }
    }

    async fn seed_startable_job(store: &MemoryStore) -> Task {
        store
            .add_instance(Instance {
                hostname: "hybrid-1".to_string(),
                node_type: NodeType::Hybrid,
                capacity: 100,
                enabled: true,
            })
            .await;
        store
            .add_group(InstanceGroup {
                name: "controlplane".to_string(),
                instances: vec!["hybrid-1".to_string()],
                is_container_group: false,
            })
            .await;
        store
            .add_group(InstanceGroup {
                name: "default".to_string(),
                instances: vec!["hybrid-1".to_string()],
                is_container_group: false,
            })
            .await;

        let mut job = Task::new(
            "nightly-deploy",
            TaskKind::PlaybookJob {
                job_template_id: Some(1),
                project_id: Some(1),
                inventory_id: Some(1),
            },
        );
        job.status = TaskStatus::Pending;
        job.dependencies_processed = true;
        store.add_task(job).await
    }

    async fn wait_for_status(store: &MemoryStore, id: i64, status: TaskStatus) -> bool {
        for _ in 0..100 {
            let task = store.task(id).await.unwrap().unwrap();
            if task.status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_reschedule_handle_triggers_cycle() {
        let f = fixture(Duration::from_secs(3600));
        let job = seed_startable_job(&f.store).await;

        let handle = f.worker.reschedule_handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        handle.notify_one();
        let running = tokio::spawn(f.worker.run(shutdown_rx));

        assert!(wait_for_status(&f.store, job.id, TaskStatus::Waiting).await);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_drives_cycles() {
        let f = fixture(Duration::from_millis(20));
        let job = seed_startable_job(&f.store).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(f.worker.run(shutdown_rx));

        assert!(wait_for_status(&f.store, job.id, TaskStatus::Waiting).await);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker_promptly() {
        let f = fixture(Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(f.worker.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        let joined = tokio::time::timeout(Duration::from_secs(5), running).await;
        assert!(joined.is_ok());
    }
}
