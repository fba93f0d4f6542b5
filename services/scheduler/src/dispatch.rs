//! Execution layer interface and mock implementation.
//!
//! The dispatcher hands placed tasks to whatever actually runs them and
//! forwards cancel requests for work already in flight. A mock implementation
//! is provided for testing and development.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};
use windlass_jobs::Task;

/// Execution layer interface.
#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    /// Submit a placed task for execution.
    async fn dispatch(&self, task: &Task) -> Result<()>;

    /// Ask the execution layer to stop a running task.
    async fn cancel(&self, task: &Task) -> Result<()>;
}

/// Default dispatcher: structured log lines only.
///
/// Runners follow the `sched_tasks` table for waiting rows, so the placement
/// write is the actual handoff. A push-based execution layer would implement
/// [`ExecutionDispatcher`] itself and replace this.
pub struct LoggingDispatcher;

#[async_trait]
impl ExecutionDispatcher for LoggingDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<()> {
        info!(
            task = %task.log_format(),
            execution_node = task.execution_node.as_deref().unwrap_or("-"),
            controller_node = task.controller_node.as_deref().unwrap_or("-"),
            instance_group = task.instance_group.as_deref().unwrap_or("-"),
            "Task handed to execution layer"
        );
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        info!(task = %task.log_format(), "Cancel requested from execution layer");
        Ok(())
    }
}

/// Mock dispatcher for testing and development.
pub struct MockDispatcher {
    /// Task ids handed over, in submission order.
    dispatched: Mutex<Vec<i64>>,

    /// Task ids cancel was requested for.
    canceled: Mutex<Vec<i64>>,

    /// Whether submissions should "fail".
    fail_dispatch: bool,
}

impl MockDispatcher {
    /// Create a new mock dispatcher.
    pub fn new() -> Self {
        Self {
            dispatched: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            fail_dispatch: false,
        }
    }

    /// Create a mock dispatcher that fails all submissions.
    pub fn failing() -> Self {
        Self {
            dispatched: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            fail_dispatch: true,
        }
    }

    /// Task ids submitted so far.
    pub fn dispatched(&self) -> Vec<i64> {
        self.dispatched.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Task ids cancel was requested for so far.
    pub fn canceled(&self) -> Vec<i64> {
        self.canceled.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionDispatcher for MockDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<()> {
        if self.fail_dispatch {
            anyhow::bail!("Mock dispatcher configured to fail");
        }

        info!(
            task = %task.log_format(),
            execution_node = task.execution_node.as_deref().unwrap_or("-"),
            instance_group = task.instance_group.as_deref().unwrap_or("-"),
            "[MOCK] Submitting task"
        );

        self.dispatched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.id);
        Ok(())
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        debug!(task = %task.log_format(), "[MOCK] Canceling task");

        self.canceled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_jobs::TaskKind;

    fn test_task() -> Task {
        let mut task = Task::new("demo", TaskKind::SystemJob);
        task.id = 42;
        task.execution_node = Some("ctrl-1".to_string());
        task
    }

    #[tokio::test]
    async fn test_mock_dispatcher_records_submissions() {
        let dispatcher = MockDispatcher::new();
        let task = test_task();

        dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(dispatcher.dispatched(), vec![42]);
    }

    #[tokio::test]
    async fn test_mock_dispatcher_records_cancels() {
        let dispatcher = MockDispatcher::new();
        let task = test_task();

        dispatcher.cancel(&task).await.unwrap();
        assert_eq!(dispatcher.canceled(), vec![42]);
    }

    #[tokio::test]
    async fn test_mock_dispatcher_failing() {
        let dispatcher = MockDispatcher::failing();
        let task = test_task();

        let result = dispatcher.dispatch(&task).await;
        assert!(result.is_err());
        assert!(dispatcher.dispatched().is_empty());
    }
}
