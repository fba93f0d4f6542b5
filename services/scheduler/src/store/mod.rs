//! Storage interface consumed by the scheduling loop.
//!
//! The scheduler never owns application data; it reads and writes scheduling
//! state through [`SchedulerStore`]. Two implementations are provided:
//! [`PgStore`] backed by Postgres, and [`MemoryStore`] for tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use windlass_jobs::{Instance, InstanceGroup, InventorySource, ModelError, Project, Task, WorkflowNode};

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The referenced task does not exist.
    #[error("task {0} not found")]
    TaskNotFound(i64),

    /// The referenced workflow node does not exist.
    #[error("workflow node {0} not found")]
    NodeNotFound(i64),

    /// Failed to decode a persisted record.
    #[error("decode error: {0}")]
    Decode(#[from] ModelError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Typed fetch and update operations used by the managers.
///
/// Every cycle rebuilds its view of the world through these calls; no
/// implementation may cache scheduling state across invocations.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    // --- Tasks ---

    /// Active tasks (pending, waiting, running) ordered by creation time
    /// ascending. Excludes internal sync launches and workflow approvals.
    async fn active_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks whose dependencies have not been processed yet, ordered
    /// by creation time ascending. Same exclusions as [`active_tasks`].
    ///
    /// [`active_tasks`]: SchedulerStore::active_tasks
    async fn pending_unprocessed_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Workflow approvals still waiting for a verdict.
    async fn pending_approvals(&self) -> Result<Vec<Task>, StoreError>;

    /// Fetch a single task.
    async fn task(&self, id: i64) -> Result<Option<Task>, StoreError>;

    /// Fetch a batch of tasks by id. Missing ids are silently dropped.
    async fn tasks(&self, ids: &[i64]) -> Result<Vec<Task>, StoreError>;

    /// Insert a new task. The store assigns the id; the caller's `id` field
    /// is ignored. Returns the stored task.
    async fn insert_task(&self, task: Task) -> Result<Task, StoreError>;

    /// Persist the given task's current state.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Flip `dependencies_processed` for the given tasks.
    async fn mark_dependencies_processed(&self, ids: &[i64]) -> Result<(), StoreError>;

    // --- Workflow graph ---

    /// All nodes of a workflow job's DAG.
    async fn workflow_nodes(&self, workflow_job_id: i64) -> Result<Vec<WorkflowNode>, StoreError>;

    /// Bulk-mark nodes as do-not-run.
    async fn mark_nodes_do_not_run(&self, node_ids: &[i64]) -> Result<(), StoreError>;

    /// Record the task spawned by a node.
    async fn set_node_job(&self, node_id: i64, job_id: i64) -> Result<(), StoreError>;

    // --- Prerequisite sources ---

    /// Project metadata for dependency synthesis.
    async fn project(&self, id: i64) -> Result<Option<Project>, StoreError>;

    /// Inventory sources belonging to an inventory.
    async fn inventory_sources(&self, inventory_id: i64) -> Result<Vec<InventorySource>, StoreError>;

    /// Most recently created project update for a project, any status.
    async fn latest_project_update(&self, project_id: i64) -> Result<Option<Task>, StoreError>;

    /// Most recently created inventory update for an inventory source.
    async fn latest_inventory_update(
        &self,
        inventory_source_id: i64,
    ) -> Result<Option<Task>, StoreError>;

    // --- Cluster topology ---

    /// Enabled instances, including hop nodes (callers filter by role).
    async fn enabled_instances(&self) -> Result<Vec<Instance>, StoreError>;

    /// All instance groups with their member lists.
    async fn instance_groups(&self) -> Result<Vec<InstanceGroup>, StoreError>;
}
