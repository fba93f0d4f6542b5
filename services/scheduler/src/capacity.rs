//! Per-instance capacity tracking and placement.
//!
//! Rebuilt from storage at the start of every cycle: remaining capacity per
//! instance is its declared capacity minus the impact of running and waiting
//! tasks already assigned to it (execution cost on the execution node, the
//! fixed controller overhead on the controller node).

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use windlass_jobs::{CapacityType, Instance, InstanceGroup, NodeType, Task};

#[derive(Debug)]
struct InstanceSlot {
    node_type: NodeType,
    capacity: i64,
    consumed: i64,
    active_tasks: usize,
}

impl InstanceSlot {
    fn remaining(&self) -> i64 {
        self.capacity - self.consumed
    }
}

/// Capacity state for one scheduling cycle.
///
/// Instances are keyed by hostname in a sorted map, so equal-capacity
/// candidates always resolve to the lexicographically smallest hostname.
#[derive(Debug, Default)]
pub struct CapacityModel {
    instances: BTreeMap<String, InstanceSlot>,
    groups: BTreeMap<String, Vec<String>>,
    container_groups: BTreeSet<String>,
    control_task_impact: i64,
}

impl CapacityModel {
    /// Build the cycle's capacity state.
    ///
    /// Hop and disabled instances never hold capacity. `active_tasks` should be
    /// the running/waiting subset; their assigned nodes are charged up front.
    pub fn build(
        instances: &[Instance],
        groups: &[InstanceGroup],
        active_tasks: &[Task],
        control_task_impact: i64,
    ) -> Self {
        let mut model = Self {
            instances: BTreeMap::new(),
            groups: BTreeMap::new(),
            container_groups: BTreeSet::new(),
            control_task_impact,
        };

        for instance in instances {
            if !instance.enabled || instance.node_type == NodeType::Hop {
                continue;
            }
            model.instances.insert(
                instance.hostname.clone(),
                InstanceSlot {
                    node_type: instance.node_type,
                    capacity: instance.capacity,
                    consumed: 0,
                    active_tasks: 0,
                },
            );
        }

        for group in groups {
            model.groups.insert(group.name.clone(), group.instances.clone());
            if group.is_container_group {
                model.container_groups.insert(group.name.clone());
            }
        }

        for task in active_tasks {
            let impact = task.effective_impact();
            if let Some(hostname) = &task.execution_node {
                model.charge(hostname, impact);
            }
            // Charged even when controller and execution node coincide: a
            // hybrid instance running its own task carries both costs.
            if let Some(hostname) = &task.controller_node {
                model.charge(hostname, control_task_impact);
            }
        }

        model
    }

    fn charge(&mut self, hostname: &str, impact: i64) {
        if let Some(slot) = self.instances.get_mut(hostname) {
            slot.consumed += impact;
            slot.active_tasks += 1;
        }
    }

    /// Whether the named group exists in this cycle's topology.
    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Whether the named group is a container group.
    pub fn is_container_group(&self, name: &str) -> bool {
        self.container_groups.contains(name)
    }

    /// Best-fit placement: the group member that would retain the most
    /// capacity after taking `impact`, skipping instances of the wrong role or
    /// without room. Hybrid instances optionally pre-charge the controller
    /// overhead they would absorb alongside the task itself.
    pub fn best_fit_instance(
        &self,
        group: &str,
        impact: i64,
        capacity_type: CapacityType,
        add_hybrid_control_cost: bool,
    ) -> Option<String> {
        let mut best: Option<(i64, &str)> = None;

        for hostname in self.group_members(group) {
            let Some(slot) = self.instances.get(hostname) else {
                continue;
            };
            if !slot.node_type.serves(capacity_type) {
                continue;
            }

            let mut would_remain = slot.remaining() - impact;
            if add_hybrid_control_cost && slot.node_type == NodeType::Hybrid {
                would_remain -= self.control_task_impact;
            }
            if would_remain < 0 {
                continue;
            }

            let better = match best {
                None => true,
                Some((best_remain, best_host)) => {
                    would_remain > best_remain
                        || (would_remain == best_remain && hostname < best_host)
                }
            };
            if better {
                best = Some((would_remain, hostname));
            }
        }

        if let Some((would_remain, hostname)) = best {
            debug!(
                group,
                instance = hostname,
                would_remain,
                impact,
                "Fit task to most-remaining-capacity instance"
            );
        }
        best.map(|(_, hostname)| hostname.to_string())
    }

    /// Fallback placement hint: the idle group member (no assigned tasks) with
    /// the greatest total capacity.
    pub fn largest_idle_instance(
        &self,
        group: &str,
        capacity_type: CapacityType,
    ) -> Option<String> {
        let mut best: Option<(i64, &str)> = None;

        for hostname in self.group_members(group) {
            let Some(slot) = self.instances.get(hostname) else {
                continue;
            };
            if !slot.node_type.serves(capacity_type) || slot.active_tasks > 0 {
                continue;
            }

            let better = match best {
                None => true,
                Some((best_capacity, best_host)) => {
                    slot.capacity > best_capacity
                        || (slot.capacity == best_capacity && hostname < best_host)
                }
            };
            if better {
                best = Some((slot.capacity, hostname));
            }
        }

        best.map(|(_, hostname)| hostname.to_string())
    }

    /// Record a finalized placement. Exhaustion is signaled by the fit
    /// functions returning none, never from here.
    pub fn consume(&mut self, hostname: &str, impact: i64) {
        self.charge(hostname, impact);
    }

    /// Node type of a tracked instance.
    pub fn node_type(&self, hostname: &str) -> Option<NodeType> {
        self.instances.get(hostname).map(|slot| slot.node_type)
    }

    /// Remaining capacity of a tracked instance.
    pub fn remaining(&self, hostname: &str) -> Option<i64> {
        self.instances.get(hostname).map(|slot| slot.remaining())
    }

    fn group_members(&self, group: &str) -> impl Iterator<Item = &str> {
        self.groups
            .get(group)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(hostname: &str, node_type: NodeType, capacity: i64) -> Instance {
        Instance {
            hostname: hostname.to_string(),
            node_type,
            capacity,
            enabled: true,
        }
    }

    fn group(name: &str, members: &[&str]) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            instances: members.iter().map(|m| m.to_string()).collect(),
            is_container_group: false,
        }
    }

    fn model(instances: &[Instance], groups: &[InstanceGroup]) -> CapacityModel {
        CapacityModel::build(instances, groups, &[], 1)
    }

    #[test]
    fn test_best_fit_prefers_most_remaining() {
        let model = model(
            &[
                instance("exec-small", NodeType::Execution, 50),
                instance("exec-large", NodeType::Execution, 100),
            ],
            &[group("default", &["exec-small", "exec-large"])],
        );

        let fit = model.best_fit_instance("default", 100, CapacityType::Execution, false);
        assert_eq!(fit.as_deref(), Some("exec-large"));

        let fit = model.best_fit_instance("default", 30, CapacityType::Execution, false);
        assert_eq!(fit.as_deref(), Some("exec-large"));
    }

    #[test]
    fn test_best_fit_tie_breaks_by_hostname() {
        let model = model(
            &[
                instance("exec-b", NodeType::Execution, 40),
                instance("exec-a", NodeType::Execution, 40),
            ],
            &[group("default", &["exec-b", "exec-a"])],
        );

        let fit = model.best_fit_instance("default", 10, CapacityType::Execution, false);
        assert_eq!(fit.as_deref(), Some("exec-a"));
    }

    #[test]
    fn test_best_fit_rejects_wrong_role_and_exhausted() {
        let model = model(
            &[
                instance("ctrl-1", NodeType::Control, 100),
                instance("exec-1", NodeType::Execution, 10),
            ],
            &[group("default", &["ctrl-1", "exec-1"])],
        );

        assert!(model
            .best_fit_instance("default", 20, CapacityType::Execution, false)
            .is_none());
        assert_eq!(
            model
                .best_fit_instance("default", 20, CapacityType::Control, false)
                .as_deref(),
            Some("ctrl-1")
        );
    }

    #[test]
    fn test_hybrid_control_cost_counts_against_fit() {
        let model = CapacityModel::build(
            &[instance("hybrid-1", NodeType::Hybrid, 10)],
            &[group("default", &["hybrid-1"])],
            &[],
            3,
        );

        // 8 + 3 overhead exceeds 10; without the overhead it fits.
        assert!(model
            .best_fit_instance("default", 8, CapacityType::Execution, true)
            .is_none());
        assert_eq!(
            model
                .best_fit_instance("default", 8, CapacityType::Execution, false)
                .as_deref(),
            Some("hybrid-1")
        );
    }

    #[test]
    fn test_largest_idle_skips_busy_instances() {
        let mut model = model(
            &[
                instance("exec-1", NodeType::Execution, 100),
                instance("exec-2", NodeType::Execution, 60),
            ],
            &[group("default", &["exec-1", "exec-2"])],
        );

        assert_eq!(
            model
                .largest_idle_instance("default", CapacityType::Execution)
                .as_deref(),
            Some("exec-1")
        );

        model.consume("exec-1", 5);
        assert_eq!(
            model
                .largest_idle_instance("default", CapacityType::Execution)
                .as_deref(),
            Some("exec-2")
        );
    }

    #[test]
    fn test_build_excludes_hop_and_disabled() {
        let mut disabled = instance("exec-off", NodeType::Execution, 100);
        disabled.enabled = false;
        let model = model(
            &[
                disabled,
                instance("hop-1", NodeType::Hop, 100),
                instance("exec-1", NodeType::Execution, 10),
            ],
            &[group("default", &["exec-off", "hop-1", "exec-1"])],
        );

        let fit = model.best_fit_instance("default", 50, CapacityType::Execution, false);
        assert!(fit.is_none());
        assert_eq!(model.remaining("exec-1"), Some(10));
        assert_eq!(model.remaining("hop-1"), None);
    }

    #[test]
    fn test_consume_reduces_remaining() {
        let mut model = model(
            &[instance("exec-1", NodeType::Execution, 100)],
            &[group("default", &["exec-1"])],
        );

        model.consume("exec-1", 40);
        assert_eq!(model.remaining("exec-1"), Some(60));

        let fit = model.best_fit_instance("default", 70, CapacityType::Execution, false);
        assert!(fit.is_none());
    }
}
