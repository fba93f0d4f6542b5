//! The three manager classes that make up the scheduling loop.
//!
//! Each manager covers one concern and runs under its own cluster-wide named
//! lock:
//! - [`DependencyManager`] synthesizes prerequisite updates for pending tasks
//! - [`WorkflowManager`] advances workflow DAGs and expires stale approvals
//! - [`TaskManager`] places pending tasks onto instances and dispatches them
//!
//! A full cycle runs them in that order. Managers share no state between
//! cycles; every pass rebuilds its view of the world from the store.

mod dependency;
mod task;
mod workflow;
mod worker;

pub use dependency::{DependencyManager, DependencyStats};
pub use task::{TaskManager, TaskManagerStats};
pub use workflow::{WorkflowManager, WorkflowStats};
pub use worker::{SchedulerMetrics, SchedulerWorker};

use tracing::warn;
use windlass_jobs::{SchedulerEvent, Task};

use crate::locking::LockError;
use crate::sinks::{EventSink, NotificationOutcome, NotificationSink};
use crate::store::StoreError;

/// Result type for manager operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that abort a manager's cycle.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

/// Publish an event, logging instead of failing when the sink is down.
/// Event delivery is advisory and never aborts a cycle.
pub(crate) async fn emit(events: &dyn EventSink, event: SchedulerEvent) {
    let event_type = event.event_type.clone();
    if let Err(e) = events.publish(event).await {
        warn!(event_type = %event_type, error = %e, "Failed to publish scheduler event");
    }
}

/// Send an outcome notification with the same advisory semantics as [`emit`].
pub(crate) async fn notify(
    notifications: &dyn NotificationSink,
    task: &Task,
    outcome: NotificationOutcome,
) {
    if let Err(e) = notifications.notify(task, outcome).await {
        warn!(task = %task.log_format(), error = %e, "Failed to send outcome notification");
    }
}
