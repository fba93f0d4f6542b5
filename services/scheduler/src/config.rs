//! Service configuration, loaded from environment variables.

use std::time::Duration;

use anyhow::Result;

use crate::db::DbConfig;

/// Top-level configuration for the scheduler daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("WINDLASS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("WINDLASS_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            log_level,
            dev_mode,
            database: DbConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        })
    }
}

/// Tuning knobs injected into each manager.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the periodic worker wakes up.
    pub schedule_interval: Duration,

    /// Maximum tasks started per cycle; exhausting it requests a follow-up
    /// cycle instead of continuing.
    pub start_task_limit: usize,

    /// Minimum time a task must have been pending before its
    /// `job_explanation` is rewritten. Limits write churn while a task flips
    /// between blocked and unblocked.
    pub job_explanation_grace: Duration,

    /// Upper bound on time spent inside one scheduling cycle.
    pub cycle_deadline: Duration,

    /// Control-plane cost units charged per task for its controller role.
    pub control_task_impact: i64,

    /// Instance group holding the control-plane nodes.
    pub control_plane_group: String,

    /// Fallback execution group for tasks with no preferred groups.
    pub default_execution_group: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(20),
            start_task_limit: 100,
            job_explanation_grace: Duration::from_secs(30),
            cycle_deadline: Duration::from_secs(300),
            control_task_impact: 1,
            control_plane_group: "controlplane".to_string(),
            default_execution_group: "default".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let schedule_interval = env_secs("WINDLASS_SCHEDULE_INTERVAL_SECS")
            .unwrap_or(defaults.schedule_interval);
        let start_task_limit = std::env::var("WINDLASS_START_TASK_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.start_task_limit);
        let job_explanation_grace = env_secs("WINDLASS_JOB_EXPLANATION_GRACE_SECS")
            .unwrap_or(defaults.job_explanation_grace);
        let cycle_deadline =
            env_secs("WINDLASS_CYCLE_DEADLINE_SECS").unwrap_or(defaults.cycle_deadline);
        let control_task_impact = std::env::var("WINDLASS_CONTROL_TASK_IMPACT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.control_task_impact);
        let control_plane_group = std::env::var("WINDLASS_CONTROL_PLANE_GROUP")
            .unwrap_or(defaults.control_plane_group);
        let default_execution_group = std::env::var("WINDLASS_DEFAULT_EXECUTION_GROUP")
            .unwrap_or(defaults.default_execution_group);

        Self {
            schedule_interval,
            start_task_limit,
            job_explanation_grace,
            cycle_deadline,
            control_task_impact,
            control_plane_group,
            default_execution_group,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.schedule_interval, Duration::from_secs(20));
        assert_eq!(config.start_task_limit, 100);
        assert_eq!(config.job_explanation_grace, Duration::from_secs(30));
        assert_eq!(config.control_task_impact, 1);
        assert_eq!(config.control_plane_group, "controlplane");
        assert_eq!(config.default_execution_group, "default");
    }
}
