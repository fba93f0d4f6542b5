//! Scheduler event definitions.
//!
//! Every scheduler-driven state transition is recorded as an explicit event so
//! downstream consumers (UI, audit, notifications) never depend on implicit
//! side effects inside the scheduling loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All scheduler event type names as constants.
pub mod event_types {
    // Task lifecycle
    pub const TASK_WAITING: &str = "task.waiting";
    pub const TASK_RUNNING: &str = "task.running";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELED: &str = "task.canceled";
    pub const TASK_REAPED: &str = "task.reaped";

    // Dependency synthesis
    pub const DEPENDENCIES_CREATED: &str = "task.dependencies_created";

    // Workflow lifecycle
    pub const WORKFLOW_RUNNING: &str = "workflow.running";
    pub const WORKFLOW_SUCCESSFUL: &str = "workflow.successful";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_CANCELED: &str = "workflow.canceled";
    pub const WORKFLOW_NODE_SPAWNED: &str = "workflow.node_spawned";

    // Approvals
    pub const APPROVAL_TIMED_OUT: &str = "approval.timed_out";
}

/// A single scheduler event with its task context and free-form payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// One of the [`event_types`] constants.
    pub event_type: String,

    /// Task the event concerns, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl SchedulerEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: &str, task_id: Option<i64>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            task_id,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Creates a task status-change event.
    pub fn status_change(event_type: &str, task_id: i64, status: &str) -> Self {
        Self::new(event_type, Some(task_id), serde_json::json!({ "status": status }))
    }
}
