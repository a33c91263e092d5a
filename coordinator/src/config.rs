//! Coordinator configuration: defaults, YAML file loading, CLI overrides

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use coordinator_sdk::RunId;

/// Tunables for a coordination run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of worker loops to spawn
    pub workers: usize,
    /// Per-task execution deadline; exceeding it fails the task
    pub task_timeout_secs: u64,
    /// Heartbeat age after which a worker counts as crashed and its
    /// running tasks and locks are reclaimed
    pub stall_timeout_secs: u64,
    /// Hard wall-clock cap for the whole run; exceeding it ends the run
    /// as partial
    pub run_timeout_secs: u64,
    /// Initial worker polling sleep when no task is eligible
    pub poll_interval_ms: u64,
    /// Ceiling for the exponential polling backoff
    pub max_poll_interval_ms: u64,
    /// Bounded retries for store operations before escalating
    pub store_retry_attempts: u32,
    /// Session database location; defaults under ~/.task-coordinator
    pub db_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_timeout_secs: 300,
            stall_timeout_secs: 60,
            run_timeout_secs: 3600,
            poll_interval_ms: 250,
            max_poll_interval_ms: 5000,
            store_retry_attempts: 3,
            db_path: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.task_timeout_secs == 0 {
            bail!("task_timeout_secs must be at least 1");
        }
        if self.poll_interval_ms == 0 || self.max_poll_interval_ms < self.poll_interval_ms {
            bail!("poll intervals must satisfy 0 < poll_interval_ms <= max_poll_interval_ms");
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Session database path for a run: configured path, or a per-run file
    /// under the user's data directory
    pub fn session_db_path(&self, run_id: RunId) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".task-coordinator")
            .join(format!("run-{}.db", run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let yaml = r#"
workers: 2
task_timeout_secs: 10
"#;
        let config: CoordinatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.task_timeout_secs, 10);
        assert_eq!(config.poll_interval_ms, 250);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = CoordinatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_poll_intervals() {
        let config = CoordinatorConfig {
            poll_interval_ms: 1000,
            max_poll_interval_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_db_path_prefers_configured_path() {
        let config = CoordinatorConfig {
            db_path: Some(PathBuf::from("/tmp/session.db")),
            ..Default::default()
        };
        assert_eq!(
            config.session_db_path(RunId::new()),
            PathBuf::from("/tmp/session.db")
        );
    }
}
