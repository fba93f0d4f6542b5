//! Test harness for scheduler integration tests.
//!
//! Wires the three managers against the in-memory store and provides builders
//! for clusters, tasks, prerequisite resources, and workflow topologies.

// Each integration test crate uses its own slice of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use windlass_jobs::{
    Instance, InstanceGroup, InventorySource, NodeTemplate, NodeType, Project, Task, TaskKind,
    TaskStatus, WorkflowNode,
};
use windlass_scheduler::config::SchedulerConfig;
use windlass_scheduler::dispatch::MockDispatcher;
use windlass_scheduler::locking::LocalLock;
use windlass_scheduler::managers::{DependencyManager, TaskManager, WorkflowManager};
use windlass_scheduler::sinks::{MemoryEventSink, MemoryNotificationSink};
use windlass_scheduler::store::{MemoryStore, SchedulerStore};

/// The three managers wired to one in-memory world.
pub struct Scheduler {
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventSink>,
    pub notifications: Arc<MemoryNotificationSink>,
    pub dispatcher: Arc<MockDispatcher>,
    pub dependency: DependencyManager,
    pub workflow: WorkflowManager,
    pub task: TaskManager,
}

impl Scheduler {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let notifications = Arc::new(MemoryNotificationSink::new());
        let lock = Arc::new(LocalLock::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        let dependency = DependencyManager::new(store.clone(), events.clone(), lock.clone());
        let workflow = WorkflowManager::new(
            store.clone(),
            events.clone(),
            notifications.clone(),
            lock.clone(),
            dispatcher.clone(),
        );
        let task = TaskManager::new(
            store.clone(),
            events.clone(),
            notifications.clone(),
            lock.clone(),
            dispatcher.clone(),
            SchedulerConfig::default(),
        );
        Self {
            store,
            events,
            notifications,
            dispatcher,
            dependency,
            workflow,
            task,
        }
    }

    /// One full scheduling cycle in manager order: dependencies, workflows,
    /// then task placement.
    pub async fn cycle(&self) {
        self.dependency.schedule().await.unwrap();
        self.workflow.schedule().await.unwrap();
        self.task.schedule().await.unwrap();
    }

    /// Conclude a task the way the execution layer would.
    pub async fn conclude(&self, id: i64, status: TaskStatus) {
        let mut task = self.store.task(id).await.unwrap().unwrap();
        task.status = status;
        task.finished = Some(Utc::now());
        self.store.update_task(&task).await.unwrap();
    }

    pub async fn get(&self, id: i64) -> Task {
        self.store.task(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: i64) -> TaskStatus {
        self.get(id).await.status
    }

    /// Waiting and running tasks assigned to the given execution node.
    pub async fn assigned_to(&self, hostname: &str) -> Vec<Task> {
        self.store
            .active_tasks()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| {
                matches!(t.status, TaskStatus::Waiting | TaskStatus::Running)
                    && t.execution_node.as_deref() == Some(hostname)
            })
            .collect()
    }
}

/// One control node and one execution node, both with room to spare.
pub async fn seed_standard_cluster(s: &Scheduler) {
    seed_cluster(s, 100, 100).await;
}

pub async fn seed_cluster(s: &Scheduler, control_capacity: i64, execution_capacity: i64) {
    s.store
        .add_instance(Instance {
            hostname: "control-1".to_string(),
            node_type: NodeType::Control,
            capacity: control_capacity,
            enabled: true,
        })
        .await;
    s.store
        .add_instance(Instance {
            hostname: "exec-1".to_string(),
            node_type: NodeType::Execution,
            capacity: execution_capacity,
            enabled: true,
        })
        .await;
    s.store
        .add_group(InstanceGroup {
            name: "controlplane".to_string(),
            instances: vec!["control-1".to_string()],
            is_container_group: false,
        })
        .await;
    s.store
        .add_group(InstanceGroup {
            name: "default".to_string(),
            instances: vec!["exec-1".to_string()],
            is_container_group: false,
        })
        .await;
}

/// Pending playbook job, old enough that blocked annotations are written.
pub fn playbook_job(name: &str, template_id: i64, project_id: i64, inventory_id: i64) -> Task {
    let mut task = Task::new(
        name,
        TaskKind::PlaybookJob {
            job_template_id: Some(template_id),
            project_id: Some(project_id),
            inventory_id: Some(inventory_id),
        },
    );
    task.status = TaskStatus::Pending;
    task.task_impact = 3;
    task.created = Utc::now() - Duration::seconds(90);
    task.modified = task.created;
    task
}

pub fn scm_project(id: i64, cache_timeout: i64) -> Project {
    Project {
        id,
        name: format!("project-{id}"),
        scm_update_on_launch: true,
        scm_update_cache_timeout: cache_timeout,
    }
}

pub fn refreshed_inventory_source(id: i64, inventory_id: i64) -> InventorySource {
    InventorySource {
        id,
        name: format!("source-{id}"),
        inventory_id,
        update_on_launch: true,
        update_cache_timeout: 0,
    }
}

/// Pending workflow job in the given template.
pub fn workflow_job(name: &str, template_id: i64) -> Task {
    let mut task = Task::new(
        name,
        TaskKind::WorkflowJob {
            workflow_job_template_id: Some(template_id),
        },
    );
    task.status = TaskStatus::Pending;
    task.created = Utc::now() - Duration::seconds(90);
    task.modified = task.created;
    task
}

pub fn job_template(id: i64) -> NodeTemplate {
    NodeTemplate::JobTemplate {
        id,
        name: format!("template-{id}"),
        project_id: Some(1),
        inventory_id: Some(1),
        task_impact: 3,
        allow_simultaneous: false,
    }
}

pub fn node(workflow_job_id: i64, template: Option<NodeTemplate>) -> WorkflowNode {
    WorkflowNode {
        id: 0,
        workflow_job_id,
        template,
        job_id: None,
        success_nodes: Vec::new(),
        failure_nodes: Vec::new(),
        always_nodes: Vec::new(),
        do_not_run: false,
    }
}
