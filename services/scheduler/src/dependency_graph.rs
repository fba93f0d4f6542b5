//! Per-cycle resource conflict map.
//!
//! Rebuilt each cycle from the running/waiting subset, then extended as tasks
//! start. Each entry records which task currently occupies a resource key, so
//! a conflicting candidate can name exactly what it is waiting on.

use std::collections::BTreeMap;

use windlass_jobs::{Task, TaskKind};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Project id → task id of the active update.
    project_updates: BTreeMap<i64, i64>,
    /// Inventory id → task id of an active update against any of its sources.
    inventory_updates: BTreeMap<i64, i64>,
    /// Inventory source id → task id of the active update.
    inventory_source_updates: BTreeMap<i64, i64>,
    /// Job template id → task id of an active job from that template.
    job_template_jobs: BTreeMap<i64, i64>,
    /// Workflow template id → task id of an active workflow from that template.
    workflow_template_jobs: BTreeMap<i64, i64>,
    /// System jobs are a cluster-wide singleton.
    system_job: Option<i64>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the resource keys an active task occupies.
    pub fn add_job(&mut self, task: &Task) {
        match &task.kind {
            TaskKind::ProjectUpdate { project_id } => {
                self.project_updates.insert(*project_id, task.id);
            }
            TaskKind::InventoryUpdate {
                inventory_source_id,
                inventory_id,
            } => {
                self.inventory_updates.insert(*inventory_id, task.id);
                self.inventory_source_updates
                    .insert(*inventory_source_id, task.id);
            }
            TaskKind::PlaybookJob {
                job_template_id, ..
            } => {
                if let Some(template_id) = job_template_id {
                    self.job_template_jobs.insert(*template_id, task.id);
                }
            }
            TaskKind::WorkflowJob {
                workflow_job_template_id,
            } => {
                if let Some(template_id) = workflow_job_template_id {
                    self.workflow_template_jobs.insert(*template_id, task.id);
                }
            }
            TaskKind::SystemJob => {
                self.system_job = Some(task.id);
            }
            // Ad hoc commands and approvals occupy no conflict keys.
            TaskKind::AdHocCommand { .. } | TaskKind::WorkflowApproval { .. } => {}
        }
    }

    /// The id of the registered task that conflicts with this candidate, if any.
    ///
    /// `allow_simultaneous` relaxes only same-template collisions; resource
    /// conflicts (an update touching the candidate's project or inventory)
    /// always block.
    pub fn task_blocked_by(&self, task: &Task) -> Option<i64> {
        match &task.kind {
            TaskKind::ProjectUpdate { project_id } => {
                self.project_updates.get(project_id).copied()
            }
            TaskKind::InventoryUpdate {
                inventory_source_id,
                ..
            } => self
                .inventory_source_updates
                .get(inventory_source_id)
                .copied(),
            TaskKind::PlaybookJob {
                job_template_id,
                project_id,
                inventory_id,
            } => {
                let project_block =
                    project_id.and_then(|id| self.project_updates.get(&id).copied());
                let inventory_block =
                    inventory_id.and_then(|id| self.inventory_updates.get(&id).copied());
                let template_block = if task.allow_simultaneous {
                    None
                } else {
                    job_template_id.and_then(|id| self.job_template_jobs.get(&id).copied())
                };
                project_block.or(inventory_block).or(template_block)
            }
            TaskKind::AdHocCommand { inventory_id } => {
                inventory_id.and_then(|id| self.inventory_updates.get(&id).copied())
            }
            TaskKind::SystemJob => self.system_job,
            TaskKind::WorkflowJob {
                workflow_job_template_id,
            } => {
                if task.allow_simultaneous {
                    None
                } else {
                    workflow_job_template_id
                        .and_then(|id| self.workflow_template_jobs.get(&id).copied())
                }
            }
            TaskKind::WorkflowApproval { .. } => None,
        }
    }
}
