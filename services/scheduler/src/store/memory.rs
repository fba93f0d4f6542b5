//! In-memory store implementation for tests and development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use windlass_jobs::{
    Instance, InstanceGroup, InventorySource, Project, Task, TaskKind, TaskStatus, WorkflowNode,
};

use super::{SchedulerStore, StoreError};

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<i64, Task>,
    nodes: BTreeMap<i64, WorkflowNode>,
    projects: BTreeMap<i64, Project>,
    inventory_sources: BTreeMap<i64, InventorySource>,
    instances: Vec<Instance>,
    groups: Vec<InstanceGroup>,
    next_id: i64,
}

impl Inner {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn note_id(&mut self, id: i64) {
        if id > self.next_id {
            self.next_id = id;
        }
    }
}

/// Mutex-held map store. Every operation is atomic; ordering matches the
/// Postgres implementation (creation time, then id).
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task. A zero id is replaced with a fresh one; a nonzero id is
    /// kept as-is. Returns the stored task.
    pub async fn add_task(&self, mut task: Task) -> Task {
        let mut inner = self.inner.lock().await;
        if task.id == 0 {
            task.id = inner.allocate_id();
        } else {
            inner.note_id(task.id);
        }
        inner.tasks.insert(task.id, task.clone());
        task
    }

    pub async fn add_instance(&self, instance: Instance) {
        self.inner.lock().await.instances.push(instance);
    }

    pub async fn add_group(&self, group: InstanceGroup) {
        self.inner.lock().await.groups.push(group);
    }

    pub async fn add_project(&self, project: Project) {
        self.inner.lock().await.projects.insert(project.id, project);
    }

    pub async fn add_inventory_source(&self, source: InventorySource) {
        self.inner
            .lock()
            .await
            .inventory_sources
            .insert(source.id, source);
    }

    /// Seed a workflow node. A zero id is replaced with a fresh one.
    pub async fn add_node(&self, mut node: WorkflowNode) -> WorkflowNode {
        let mut inner = self.inner.lock().await;
        if node.id == 0 {
            node.id = inner.allocate_id();
        } else {
            inner.note_id(node.id);
        }
        inner.nodes.insert(node.id, node.clone());
        node
    }

    /// Disable an instance in place, as an operator would.
    pub async fn disable_instance(&self, hostname: &str) {
        let mut inner = self.inner.lock().await;
        for instance in &mut inner.instances {
            if instance.hostname == hostname {
                instance.enabled = false;
            }
        }
    }
}

fn is_schedulable(task: &Task) -> bool {
    !matches!(task.kind, TaskKind::WorkflowApproval { .. })
        && task.launch_type != windlass_jobs::LaunchType::Sync
}

fn sorted_by_age(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
    tasks
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let tasks = inner
            .tasks
            .values()
            .filter(|t| t.status.is_active() && is_schedulable(t))
            .cloned()
            .collect();
        Ok(sorted_by_age(tasks))
    }

    async fn pending_unprocessed_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let tasks = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending && !t.dependencies_processed && is_schedulable(t)
            })
            .cloned()
            .collect();
        Ok(sorted_by_age(tasks))
    }

    async fn pending_approvals(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let tasks = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && matches!(t.kind, TaskKind::WorkflowApproval { .. })
            })
            .cloned()
            .collect();
        Ok(sorted_by_age(tasks))
    }

    async fn task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn tasks(&self, ids: &[i64]) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn insert_task(&self, mut task: Task) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        task.id = inner.allocate_id();
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&task.id) {
            return Err(StoreError::TaskNotFound(task.id));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn mark_dependencies_processed(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(task) = inner.tasks.get_mut(id) {
                task.dependencies_processed = true;
            }
        }
        Ok(())
    }

    async fn workflow_nodes(&self, workflow_job_id: i64) -> Result<Vec<WorkflowNode>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.workflow_job_id == workflow_job_id)
            .cloned()
            .collect())
    }

    async fn mark_nodes_do_not_run(&self, node_ids: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for id in node_ids {
            if let Some(node) = inner.nodes.get_mut(id) {
                node.do_not_run = true;
            }
        }
        Ok(())
    }

    async fn set_node_job(&self, node_id: i64, job_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or(StoreError::NodeNotFound(node_id))?;
        node.job_id = Some(job_id);
        Ok(())
    }

    async fn project(&self, id: i64) -> Result<Option<Project>, StoreError> {
        Ok(self.inner.lock().await.projects.get(&id).cloned())
    }

    async fn inventory_sources(
        &self,
        inventory_id: i64,
    ) -> Result<Vec<InventorySource>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .inventory_sources
            .values()
            .filter(|s| s.inventory_id == inventory_id)
            .cloned()
            .collect())
    }

    async fn latest_project_update(&self, project_id: i64) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(
                |t| matches!(t.kind, TaskKind::ProjectUpdate { project_id: p } if p == project_id),
            )
            .max_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn latest_inventory_update(
        &self,
        inventory_source_id: i64,
    ) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                matches!(t.kind, TaskKind::InventoryUpdate { inventory_source_id: s, .. }
                    if s == inventory_source_id)
            })
            .max_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn enabled_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .iter()
            .filter(|i| i.enabled)
            .cloned()
            .collect())
    }

    async fn instance_groups(&self) -> Result<Vec<InstanceGroup>, StoreError> {
        Ok(self.inner.lock().await.groups.clone())
    }
}
