//! Postgres-backed store implementation.
//!
//! Uses the runtime query API throughout; job-type payloads and edge lists are
//! stored as JSONB and decoded through the model's serde definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use windlass_jobs::{
    Instance, InstanceGroup, InventorySource, Project, Task, WorkflowNode,
};

use crate::db::Database;

use super::{SchedulerStore, StoreError};

const TASK_COLUMNS: &str = "id, name, status, created, modified, finished, launch_type, \
     task_impact, allow_simultaneous, dependencies_processed, dependent_jobs, \
     job_explanation, controller_node, execution_node, instance_group, \
     preferred_instance_groups, cancel_flag, workflow_job_id, kind";

/// Store implementation over the scheduler's Postgres tables.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch_tasks_where(
        &self,
        predicate: &str,
        order: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let query = format!(
            "SELECT {} FROM sched_tasks WHERE {} ORDER BY {}",
            TASK_COLUMNS, predicate, order
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

#[derive(Debug)]
struct TaskRow {
    id: i64,
    name: String,
    status: String,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    finished: Option<DateTime<Utc>>,
    launch_type: String,
    task_impact: i64,
    allow_simultaneous: bool,
    dependencies_processed: bool,
    dependent_jobs: serde_json::Value,
    job_explanation: String,
    controller_node: Option<String>,
    execution_node: Option<String>,
    instance_group: Option<String>,
    preferred_instance_groups: serde_json::Value,
    cancel_flag: bool,
    workflow_job_id: Option<i64>,
    kind: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            created: row.try_get("created")?,
            modified: row.try_get("modified")?,
            finished: row.try_get("finished")?,
            launch_type: row.try_get("launch_type")?,
            task_impact: row.try_get("task_impact")?,
            allow_simultaneous: row.try_get("allow_simultaneous")?,
            dependencies_processed: row.try_get("dependencies_processed")?,
            dependent_jobs: row.try_get("dependent_jobs")?,
            job_explanation: row.try_get("job_explanation")?,
            controller_node: row.try_get("controller_node")?,
            execution_node: row.try_get("execution_node")?,
            instance_group: row.try_get("instance_group")?,
            preferred_instance_groups: row.try_get("preferred_instance_groups")?,
            cancel_flag: row.try_get("cancel_flag")?,
            workflow_job_id: row.try_get("workflow_job_id")?,
            kind: row.try_get("kind")?,
        })
    }
}

impl TaskRow {
    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: self.id,
            name: self.name,
            status: self.status.parse().map_err(StoreError::Decode)?,
            created: self.created,
            modified: self.modified,
            finished: self.finished,
            launch_type: self.launch_type.parse().map_err(StoreError::Decode)?,
            task_impact: self.task_impact,
            allow_simultaneous: self.allow_simultaneous,
            dependencies_processed: self.dependencies_processed,
            dependent_jobs: serde_json::from_value(self.dependent_jobs)?,
            job_explanation: self.job_explanation,
            controller_node: self.controller_node,
            execution_node: self.execution_node,
            instance_group: self.instance_group,
            preferred_instance_groups: serde_json::from_value(self.preferred_instance_groups)?,
            cancel_flag: self.cancel_flag,
            workflow_job_id: self.workflow_job_id,
            kind: serde_json::from_value(self.kind)?,
        })
    }
}

#[derive(Debug)]
struct NodeRow {
    id: i64,
    workflow_job_id: i64,
    template: Option<serde_json::Value>,
    job_id: Option<i64>,
    success_nodes: serde_json::Value,
    failure_nodes: serde_json::Value,
    always_nodes: serde_json::Value,
    do_not_run: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_job_id: row.try_get("workflow_job_id")?,
            template: row.try_get("template")?,
            job_id: row.try_get("job_id")?,
            success_nodes: row.try_get("success_nodes")?,
            failure_nodes: row.try_get("failure_nodes")?,
            always_nodes: row.try_get("always_nodes")?,
            do_not_run: row.try_get("do_not_run")?,
        })
    }
}

impl NodeRow {
    fn into_node(self) -> Result<WorkflowNode, StoreError> {
        Ok(WorkflowNode {
            id: self.id,
            workflow_job_id: self.workflow_job_id,
            template: match self.template {
                Some(value) => serde_json::from_value(value)?,
                None => None,
            },
            job_id: self.job_id,
            success_nodes: serde_json::from_value(self.success_nodes)?,
            failure_nodes: serde_json::from_value(self.failure_nodes)?,
            always_nodes: serde_json::from_value(self.always_nodes)?,
            do_not_run: self.do_not_run,
        })
    }
}

#[derive(Debug)]
struct InstanceRow {
    hostname: String,
    node_type: String,
    capacity: i64,
    enabled: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            hostname: row.try_get("hostname")?,
            node_type: row.try_get("node_type")?,
            capacity: row.try_get("capacity")?,
            enabled: row.try_get("enabled")?,
        })
    }
}

#[async_trait]
impl SchedulerStore for PgStore {
    async fn active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.fetch_tasks_where(
            "status IN ('pending', 'waiting', 'running') \
             AND launch_type <> 'sync' \
             AND kind->>'type' <> 'workflow_approval'",
            "created ASC, id ASC",
        )
        .await
    }

    async fn pending_unprocessed_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.fetch_tasks_where(
            "status = 'pending' \
             AND dependencies_processed = FALSE \
             AND launch_type <> 'sync' \
             AND kind->>'type' <> 'workflow_approval'",
            "created ASC, id ASC",
        )
        .await
    }

    async fn pending_approvals(&self) -> Result<Vec<Task>, StoreError> {
        self.fetch_tasks_where(
            "status = 'pending' AND kind->>'type' = 'workflow_approval'",
            "created ASC, id ASC",
        )
        .await
    }

    async fn task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let query = format!("SELECT {} FROM sched_tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn tasks(&self, ids: &[i64]) -> Result<Vec<Task>, StoreError> {
        let query = format!("SELECT {} FROM sched_tasks WHERE id = ANY($1)", TASK_COLUMNS);
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(ids)
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn insert_task(&self, task: Task) -> Result<Task, StoreError> {
        let query = format!(
            "INSERT INTO sched_tasks (name, status, created, modified, finished, launch_type, \
             task_impact, allow_simultaneous, dependencies_processed, dependent_jobs, \
             job_explanation, controller_node, execution_node, instance_group, \
             preferred_instance_groups, cancel_flag, workflow_job_id, kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             RETURNING {}",
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(&task.name)
            .bind(task.status.as_str())
            .bind(task.created)
            .bind(task.modified)
            .bind(task.finished)
            .bind(task.launch_type.as_str())
            .bind(task.task_impact)
            .bind(task.allow_simultaneous)
            .bind(task.dependencies_processed)
            .bind(serde_json::to_value(&task.dependent_jobs)?)
            .bind(&task.job_explanation)
            .bind(&task.controller_node)
            .bind(&task.execution_node)
            .bind(&task.instance_group)
            .bind(serde_json::to_value(&task.preferred_instance_groups)?)
            .bind(task.cancel_flag)
            .bind(task.workflow_job_id)
            .bind(serde_json::to_value(&task.kind)?)
            .fetch_one(self.db.pool())
            .await?;
        row.into_task()
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sched_tasks SET name = $2, status = $3, modified = $4, finished = $5, \
             task_impact = $6, allow_simultaneous = $7, dependencies_processed = $8, \
             dependent_jobs = $9, job_explanation = $10, controller_node = $11, \
             execution_node = $12, instance_group = $13, preferred_instance_groups = $14, \
             cancel_flag = $15, workflow_job_id = $16, kind = $17 \
             WHERE id = $1",
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(task.status.as_str())
        .bind(task.modified)
        .bind(task.finished)
        .bind(task.task_impact)
        .bind(task.allow_simultaneous)
        .bind(task.dependencies_processed)
        .bind(serde_json::to_value(&task.dependent_jobs)?)
        .bind(&task.job_explanation)
        .bind(&task.controller_node)
        .bind(&task.execution_node)
        .bind(&task.instance_group)
        .bind(serde_json::to_value(&task.preferred_instance_groups)?)
        .bind(task.cancel_flag)
        .bind(task.workflow_job_id)
        .bind(serde_json::to_value(&task.kind)?)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.id));
        }
        Ok(())
    }

    async fn mark_dependencies_processed(&self, ids: &[i64]) -> Result<(), StoreError> {
        sqlx::query("UPDATE sched_tasks SET dependencies_processed = TRUE WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn workflow_nodes(&self, workflow_job_id: i64) -> Result<Vec<WorkflowNode>, StoreError> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, workflow_job_id, template, job_id, success_nodes, failure_nodes, \
             always_nodes, do_not_run \
             FROM sched_workflow_nodes WHERE workflow_job_id = $1 ORDER BY id ASC",
        )
        .bind(workflow_job_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(NodeRow::into_node).collect()
    }

    async fn mark_nodes_do_not_run(&self, node_ids: &[i64]) -> Result<(), StoreError> {
        sqlx::query("UPDATE sched_workflow_nodes SET do_not_run = TRUE WHERE id = ANY($1)")
            .bind(node_ids)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn set_node_job(&self, node_id: i64, job_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sched_workflow_nodes SET job_id = $2 WHERE id = $1")
            .bind(node_id)
            .bind(job_id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NodeNotFound(node_id));
        }
        Ok(())
    }

    async fn project(&self, id: i64) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query_as::<_, (i64, String, bool, i64)>(
            "SELECT id, name, scm_update_on_launch, scm_update_cache_timeout \
             FROM sched_projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|(id, name, scm_update_on_launch, scm_update_cache_timeout)| Project {
            id,
            name,
            scm_update_on_launch,
            scm_update_cache_timeout,
        }))
    }

    async fn inventory_sources(
        &self,
        inventory_id: i64,
    ) -> Result<Vec<InventorySource>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, bool, i64)>(
            "SELECT id, name, inventory_id, update_on_launch, update_cache_timeout \
             FROM sched_inventory_sources WHERE inventory_id = $1 ORDER BY id ASC",
        )
        .bind(inventory_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, name, inventory_id, update_on_launch, update_cache_timeout)| {
                    InventorySource {
                        id,
                        name,
                        inventory_id,
                        update_on_launch,
                        update_cache_timeout,
                    }
                },
            )
            .collect())
    }

    async fn latest_project_update(&self, project_id: i64) -> Result<Option<Task>, StoreError> {
        let query = format!(
            "SELECT {} FROM sched_tasks \
             WHERE kind->>'type' = 'project_update' AND (kind->>'project_id')::bigint = $1 \
             ORDER BY created DESC, id DESC LIMIT 1",
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(project_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn latest_inventory_update(
        &self,
        inventory_source_id: i64,
    ) -> Result<Option<Task>, StoreError> {
        let query = format!(
            "SELECT {} FROM sched_tasks \
             WHERE kind->>'type' = 'inventory_update' \
             AND (kind->>'inventory_source_id')::bigint = $1 \
             ORDER BY created DESC, id DESC LIMIT 1",
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(inventory_source_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn enabled_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT hostname, node_type, capacity, enabled \
             FROM sched_instances WHERE enabled = TRUE ORDER BY hostname ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Instance {
                    hostname: row.hostname,
                    node_type: row.node_type.parse().map_err(StoreError::Decode)?,
                    capacity: row.capacity,
                    enabled: row.enabled,
                })
            })
            .collect()
    }

    async fn instance_groups(&self) -> Result<Vec<InstanceGroup>, StoreError> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value, bool)>(
            "SELECT name, instances, is_container_group \
             FROM sched_instance_groups ORDER BY name ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|(name, instances, is_container_group)| {
                Ok(InstanceGroup {
                    name,
                    instances: serde_json::from_value(instances)?,
                    is_container_group,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_jobs::{LaunchType, TaskKind, TaskStatus};

    fn task_row(status: &str) -> TaskRow {
        let now = Utc::now();
        TaskRow {
            id: 7,
            name: "nightly-deploy".to_string(),
            status: status.to_string(),
            created: now,
            modified: now,
            finished: None,
            launch_type: "dependency".to_string(),
            task_impact: 3,
            allow_simultaneous: false,
            dependencies_processed: true,
            dependent_jobs: serde_json::json!([1, 2]),
            job_explanation: String::new(),
            controller_node: None,
            execution_node: Some("exec-1".to_string()),
            instance_group: Some("default".to_string()),
            preferred_instance_groups: serde_json::json!(["default"]),
            cancel_flag: false,
            workflow_job_id: None,
            kind: serde_json::json!({ "type": "project_update", "project_id": 4 }),
        }
    }

    #[test]
    fn test_task_row_decodes_enums_and_json_columns() {
        let task = task_row("pending").into_task().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.launch_type, LaunchType::Dependency);
        assert_eq!(task.dependent_jobs.iter().copied().collect::<Vec<_>>(), [1, 2]);
        assert_eq!(task.kind, TaskKind::ProjectUpdate { project_id: 4 });
    }

    #[test]
    fn test_task_row_rejects_unknown_status() {
        let err = task_row("paused").into_task().unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }
}
