//! Core scheduling types: tasks, instances, instance groups and workflow nodes.
//!
//! A [`Task`] carries the attributes every job type shares with the scheduler
//! (status, cost, dependency edges, placement fields); job-type specifics live in
//! the [`TaskKind`] tagged union and are resolved by pattern match.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

// =============================================================================
// Status and classification enums
// =============================================================================

/// Lifecycle status of a task.
///
/// Transitions are monotonic: new → pending → waiting → running → terminal.
/// A terminal status is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
    Canceled,
}

impl TaskStatus {
    /// True once the task has concluded and will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Successful | TaskStatus::Failed | TaskStatus::Error | TaskStatus::Canceled
        )
    }

    /// True while the task occupies the scheduler's attention.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::Running
        )
    }

    /// True for terminal outcomes that count as failure for dependents.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Error | TaskStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Successful => "successful",
            TaskStatus::Failed => "failed",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TaskStatus::New),
            "pending" => Ok(TaskStatus::Pending),
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "successful" => Ok(TaskStatus::Successful),
            "failed" => Ok(TaskStatus::Failed),
            "error" => Ok(TaskStatus::Error),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// How a task came to exist.
///
/// `Dependency` marks synthetic prerequisites created by the dependency manager;
/// `Sync` launches are internal bookkeeping runs excluded from scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LaunchType {
    #[default]
    Manual,
    Scheduled,
    Relaunch,
    Dependency,
    Sync,
    Workflow,
}

impl LaunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchType::Manual => "manual",
            LaunchType::Scheduled => "scheduled",
            LaunchType::Relaunch => "relaunch",
            LaunchType::Dependency => "dependency",
            LaunchType::Sync => "sync",
            LaunchType::Workflow => "workflow",
        }
    }
}

impl FromStr for LaunchType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(LaunchType::Manual),
            "scheduled" => Ok(LaunchType::Scheduled),
            "relaunch" => Ok(LaunchType::Relaunch),
            "dependency" => Ok(LaunchType::Dependency),
            "sync" => Ok(LaunchType::Sync),
            "workflow" => Ok(LaunchType::Workflow),
            other => Err(ModelError::UnknownLaunchType(other.to_string())),
        }
    }
}

/// Which capacity plane a task's cost is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityType {
    Control,
    Execution,
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityType::Control => write!(f, "control"),
            CapacityType::Execution => write!(f, "execution"),
        }
    }
}

/// Role of a cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Control,
    Execution,
    Hybrid,
    Hop,
}

impl NodeType {
    /// Whether an instance of this type can serve the given capacity plane.
    /// Hop nodes route traffic only and never run work.
    pub fn serves(&self, capacity_type: CapacityType) -> bool {
        match self {
            NodeType::Hybrid => true,
            NodeType::Control => capacity_type == CapacityType::Control,
            NodeType::Execution => capacity_type == CapacityType::Execution,
            NodeType::Hop => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Control => "control",
            NodeType::Execution => "execution",
            NodeType::Hybrid => "hybrid",
            NodeType::Hop => "hop",
        }
    }
}

impl FromStr for NodeType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(NodeType::Control),
            "execution" => Ok(NodeType::Execution),
            "hybrid" => Ok(NodeType::Hybrid),
            "hop" => Ok(NodeType::Hop),
            other => Err(ModelError::UnknownNodeType(other.to_string())),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Job-type-specific payload, limited to scheduling-relevant attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    PlaybookJob {
        job_template_id: Option<i64>,
        project_id: Option<i64>,
        inventory_id: Option<i64>,
    },
    AdHocCommand {
        inventory_id: Option<i64>,
    },
    ProjectUpdate {
        project_id: i64,
    },
    InventoryUpdate {
        inventory_source_id: i64,
        inventory_id: i64,
    },
    SystemJob,
    WorkflowJob {
        workflow_job_template_id: Option<i64>,
    },
    WorkflowApproval {
        /// Seconds after creation before the approval auto-expires. Zero means
        /// the approval waits indefinitely.
        timeout_seconds: i64,
    },
}

impl TaskKind {
    /// Short machine-readable label, used in log lines and explanations.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::PlaybookJob { .. } => "job",
            TaskKind::AdHocCommand { .. } => "ad_hoc_command",
            TaskKind::ProjectUpdate { .. } => "project_update",
            TaskKind::InventoryUpdate { .. } => "inventory_update",
            TaskKind::SystemJob => "system_job",
            TaskKind::WorkflowJob { .. } => "workflow_job",
            TaskKind::WorkflowApproval { .. } => "workflow_approval",
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    pub launch_type: LaunchType,

    /// Cost units charged against an instance while this task is active.
    pub task_impact: i64,

    /// Allow two tasks of the same template to run at once.
    pub allow_simultaneous: bool,

    /// Flipped exactly once by the dependency manager.
    pub dependencies_processed: bool,

    /// Ids of tasks that must conclude (without failing) before this one starts.
    pub dependent_jobs: BTreeSet<i64>,

    /// Human-readable reason the task is not running. Empty when none.
    pub job_explanation: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_node: Option<String>,
    /// Pool the task was finally placed in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
    /// Candidate pools in preference order; empty falls back to the configured
    /// default execution group.
    pub preferred_instance_groups: Vec<String>,

    /// Cooperative cancel request, observed and finalized on a later cycle.
    pub cancel_flag: bool,

    /// Workflow job this task was spawned by, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_job_id: Option<i64>,

    pub kind: TaskKind,
}

impl Task {
    /// Fresh task in `new` status with neutral defaults. The id is assigned by
    /// storage on insert; callers override timestamps and launch metadata as
    /// needed before persisting.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        let now = Utc::now();
        Task {
            id: 0,
            name: name.into(),
            status: TaskStatus::New,
            created: now,
            modified: now,
            finished: None,
            launch_type: LaunchType::Manual,
            task_impact: 1,
            allow_simultaneous: false,
            dependencies_processed: false,
            dependent_jobs: BTreeSet::new(),
            job_explanation: String::new(),
            controller_node: None,
            execution_node: None,
            instance_group: None,
            preferred_instance_groups: Vec::new(),
            cancel_flag: false,
            workflow_job_id: None,
            kind,
        }
    }

    /// Which capacity plane the task charges.
    ///
    /// Workflow jobs and approvals are control-plane bookkeeping; they are never
    /// placed on an instance and report zero impact.
    pub fn capacity_type(&self) -> CapacityType {
        match self.kind {
            TaskKind::PlaybookJob { .. } | TaskKind::AdHocCommand { .. } => {
                CapacityType::Execution
            }
            TaskKind::ProjectUpdate { .. }
            | TaskKind::InventoryUpdate { .. }
            | TaskKind::SystemJob
            | TaskKind::WorkflowJob { .. }
            | TaskKind::WorkflowApproval { .. } => CapacityType::Control,
        }
    }

    /// Effective cost units for placement.
    pub fn effective_impact(&self) -> i64 {
        match self.kind {
            TaskKind::WorkflowJob { .. } | TaskKind::WorkflowApproval { .. } => 0,
            _ => self.task_impact,
        }
    }

    /// Whether this task is scheduled through instance placement at all.
    pub fn is_placed(&self) -> bool {
        !matches!(
            self.kind,
            TaskKind::WorkflowJob { .. } | TaskKind::WorkflowApproval { .. }
        )
    }

    /// Validates that the resources the task needs to start actually exist.
    /// Returns the missing-resource description on failure.
    pub fn pre_start_check(&self) -> Result<(), String> {
        match &self.kind {
            TaskKind::PlaybookJob {
                project_id,
                inventory_id,
                ..
            } => {
                if project_id.is_none() {
                    return Err("missing related project".to_string());
                }
                if inventory_id.is_none() {
                    return Err("missing related inventory".to_string());
                }
                Ok(())
            }
            TaskKind::AdHocCommand { inventory_id } => {
                if inventory_id.is_none() {
                    return Err("missing related inventory".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stable `kind-id` handle used in log lines and explanations.
    pub fn log_format(&self) -> String {
        format!("{}-{}", self.kind.label(), self.id)
    }
}

// =============================================================================
// Cluster topology
// =============================================================================

/// A cluster member that can hold task capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub hostname: String,
    pub node_type: NodeType,
    pub capacity: i64,
    pub enabled: bool,
}

/// Named, ordered pool of instances a task may be placed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub name: String,
    /// Member hostnames in the pool's configured order.
    pub instances: Vec<String>,
    /// Container groups execute elsewhere and bypass capacity accounting.
    pub is_container_group: bool,
}

// =============================================================================
// Workflow graph
// =============================================================================

/// What a workflow node launches when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeTemplate {
    JobTemplate {
        id: i64,
        name: String,
        project_id: Option<i64>,
        inventory_id: Option<i64>,
        task_impact: i64,
        allow_simultaneous: bool,
    },
    Project {
        id: i64,
        name: String,
    },
    InventorySource {
        id: i64,
        name: String,
        inventory_id: i64,
    },
    SystemJobTemplate {
        id: i64,
        name: String,
    },
    WorkflowJobTemplate {
        id: i64,
        name: String,
        allow_simultaneous: bool,
    },
    ApprovalTemplate {
        id: i64,
        name: String,
        timeout_seconds: i64,
    },
}

impl NodeTemplate {
    pub fn id(&self) -> i64 {
        match self {
            NodeTemplate::JobTemplate { id, .. }
            | NodeTemplate::Project { id, .. }
            | NodeTemplate::InventorySource { id, .. }
            | NodeTemplate::SystemJobTemplate { id, .. }
            | NodeTemplate::WorkflowJobTemplate { id, .. }
            | NodeTemplate::ApprovalTemplate { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NodeTemplate::JobTemplate { name, .. }
            | NodeTemplate::Project { name, .. }
            | NodeTemplate::InventorySource { name, .. }
            | NodeTemplate::SystemJobTemplate { name, .. }
            | NodeTemplate::WorkflowJobTemplate { name, .. }
            | NodeTemplate::ApprovalTemplate { name, .. } => name,
        }
    }
}

/// One node of a workflow job's DAG.
///
/// Spawns at most one task over its lifetime; `do_not_run` is set once the
/// node's trigger edges can no longer fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: i64,
    pub workflow_job_id: i64,
    /// Template the node launches; a node without one resolves as a no-op.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<NodeTemplate>,
    /// Task spawned by this node, once it has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    pub success_nodes: Vec<i64>,
    pub failure_nodes: Vec<i64>,
    pub always_nodes: Vec<i64>,
    pub do_not_run: bool,
}

// =============================================================================
// Prerequisite source records
// =============================================================================

/// Source-control project metadata the dependency manager consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub scm_update_on_launch: bool,
    /// Seconds a successful update stays fresh. Zero means always stale.
    pub scm_update_cache_timeout: i64,
}

/// Inventory source metadata the dependency manager consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySource {
    pub id: i64,
    pub name: String,
    pub inventory_id: i64,
    pub update_on_launch: bool,
    pub update_cache_timeout: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_kind(kind: TaskKind) -> Task {
        let mut task = Task::new("test", kind);
        task.id = 1;
        task.status = TaskStatus::Pending;
        task.task_impact = 5;
        task
    }

    #[test]
    fn test_status_predicates() {
        assert!(TaskStatus::Successful.is_terminal());
        assert!(TaskStatus::Canceled.is_failure());
        assert!(!TaskStatus::Successful.is_failure());
        assert!(TaskStatus::Pending.is_active());
        assert!(!TaskStatus::New.is_active());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Successful).unwrap(),
            "\"successful\""
        );
        assert_eq!("waiting".parse::<TaskStatus>().unwrap(), TaskStatus::Waiting);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_capacity_type_by_kind() {
        let job = task_with_kind(TaskKind::PlaybookJob {
            job_template_id: Some(7),
            project_id: Some(1),
            inventory_id: Some(2),
        });
        assert_eq!(job.capacity_type(), CapacityType::Execution);

        let update = task_with_kind(TaskKind::ProjectUpdate { project_id: 1 });
        assert_eq!(update.capacity_type(), CapacityType::Control);

        let workflow = task_with_kind(TaskKind::WorkflowJob {
            workflow_job_template_id: Some(3),
        });
        assert_eq!(workflow.capacity_type(), CapacityType::Control);
        assert_eq!(workflow.effective_impact(), 0);
        assert!(!workflow.is_placed());
    }

    #[test]
    fn test_node_type_serves() {
        assert!(NodeType::Hybrid.serves(CapacityType::Control));
        assert!(NodeType::Hybrid.serves(CapacityType::Execution));
        assert!(NodeType::Control.serves(CapacityType::Control));
        assert!(!NodeType::Control.serves(CapacityType::Execution));
        assert!(!NodeType::Hop.serves(CapacityType::Control));
        assert!(!NodeType::Hop.serves(CapacityType::Execution));
    }

    #[test]
    fn test_pre_start_check_missing_resources() {
        let job = task_with_kind(TaskKind::PlaybookJob {
            job_template_id: Some(7),
            project_id: None,
            inventory_id: Some(2),
        });
        assert!(job.pre_start_check().is_err());

        let ok = task_with_kind(TaskKind::PlaybookJob {
            job_template_id: Some(7),
            project_id: Some(1),
            inventory_id: Some(2),
        });
        assert!(ok.pre_start_check().is_ok());
    }

    #[test]
    fn test_log_format() {
        let update = task_with_kind(TaskKind::ProjectUpdate { project_id: 1 });
        assert_eq!(update.log_format(), "project_update-1");
    }
}
