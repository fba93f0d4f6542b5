//! Outbound event and notification seams.
//!
//! Managers announce every status change through [`EventSink`] so interested
//! consumers (UI feeds, audit trails) can follow along, and send user-facing
//! outcome notifications through [`NotificationSink`]. Both are advisory: a
//! failed publish never fails the cycle.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use windlass_jobs::{SchedulerEvent, Task};

/// Consumer of scheduler status events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: SchedulerEvent) -> Result<()>;
}

/// Default sink: structured log lines only.
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn publish(&self, event: SchedulerEvent) -> Result<()> {
        info!(
            event_type = %event.event_type,
            task_id = event.task_id,
            payload = %event.payload,
            "Scheduler event"
        );
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, in order.
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Event types published so far, in order.
    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: SchedulerEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

/// Conclusions an operator can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Succeeded,
    Failed,
    Canceled,
}

/// Consumer of user-facing outcome notifications.
///
/// Events record every transition; notifications fire only when a workflow
/// concludes or a task reaches a terminal failure without running.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, task: &Task, outcome: NotificationOutcome) -> Result<()>;
}

/// Default sink: structured log lines only.
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(&self, task: &Task, outcome: NotificationOutcome) -> Result<()> {
        info!(task = %task.log_format(), ?outcome, "Outcome notification");
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<(i64, NotificationOutcome)>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task id and outcome pairs notified so far, in order.
    pub fn sent(&self) -> Vec<(i64, NotificationOutcome)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, task: &Task, outcome: NotificationOutcome) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((task.id, outcome));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_jobs::{event_types, TaskKind};

    #[tokio::test]
    async fn test_memory_sink_collects_events() {
        let sink = MemoryEventSink::new();
        sink.publish(SchedulerEvent::status_change(
            event_types::TASK_WAITING,
            1,
            "waiting",
        ))
        .await
        .unwrap();
        sink.publish(SchedulerEvent::status_change(
            event_types::TASK_RUNNING,
            1,
            "running",
        ))
        .await
        .unwrap();

        assert_eq!(
            sink.event_types(),
            vec![event_types::TASK_WAITING, event_types::TASK_RUNNING]
        );
        assert_eq!(sink.events()[0].task_id, Some(1));
    }

    #[tokio::test]
    async fn test_memory_notification_sink_records_outcomes() {
        let sink = MemoryNotificationSink::new();
        let mut task = Task::new(
            "release",
            TaskKind::WorkflowJob {
                workflow_job_template_id: Some(1),
            },
        );
        task.id = 7;
        sink.notify(&task, NotificationOutcome::Failed).await.unwrap();

        assert_eq!(sink.sent(), vec![(7, NotificationOutcome::Failed)]);
    }
}
