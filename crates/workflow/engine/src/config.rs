//! Configuration for the workflow engine

use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use workflow_types::{RetryPolicy, WorkflowError, WorkflowResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Task queue configuration
    #[serde(default)]
    pub task_queue: TaskQueueConfig,

    /// Defaults applied to activity invocations
    #[serde(default)]
    pub activity: ActivityDefaults,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Execution event stream configuration
    #[serde(default)]
    pub events: EventsConfig,

    /// History storage configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// How long a delivered task stays leased before it is redelivered
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_ms: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: default_visibility_timeout(),
        }
    }
}

impl TaskQueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

/// Defaults for activity invocations whose options leave them unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDefaults {
    /// Initial retry interval in milliseconds
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    /// Backoff multiplier between attempts
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,

    /// Maximum retry interval in milliseconds
    #[serde(default = "default_maximum_interval")]
    pub maximum_interval_ms: u64,

    /// Maximum attempts (0 = unlimited)
    #[serde(default)]
    pub maximum_attempts: u32,
}

impl Default for ActivityDefaults {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            backoff_coefficient: default_backoff_coefficient(),
            maximum_interval_ms: default_maximum_interval(),
            maximum_attempts: 0,
        }
    }
}

impl ActivityDefaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            backoff_coefficient: self.backoff_coefficient,
            maximum_interval: Duration::from_millis(self.maximum_interval_ms),
            maximum_attempts: self.maximum_attempts,
            non_retryable_error_types: Vec::new(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent workflow task pollers per worker
    #[serde(default = "default_workflow_pollers")]
    pub max_concurrent_workflow_tasks: usize,

    /// Concurrent activity task pollers per worker
    #[serde(default = "default_activity_pollers")]
    pub max_concurrent_activity_tasks: usize,

    /// Long-poll timeout in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflow_tasks: default_workflow_pollers(),
            max_concurrent_activity_tasks: default_activity_pollers(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Execution event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer size; slow subscribers lag beyond it
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_visibility_timeout() -> u64 {
    30_000
}

fn default_initial_interval() -> u64 {
    1_000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_maximum_interval() -> u64 {
    100_000
}

fn default_workflow_pollers() -> usize {
    2
}

fn default_activity_pollers() -> usize {
    4
}

fn default_poll_timeout() -> u64 {
    1_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration: defaults, then an optional file, then `WORKFLOW_*` variables
    pub fn load(path: Option<&str>) -> WorkflowResult<Self> {
        Self::load_inner(path).map_err(|e| WorkflowError::Config(e.to_string()))
    }

    fn load_inner(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Configuration suited to tests: short leases and fast retries
    pub fn testing() -> Self {
        Self {
            task_queue: TaskQueueConfig {
                visibility_timeout_ms: 5_000,
            },
            activity: ActivityDefaults {
                initial_interval_ms: 100,
                backoff_coefficient: 2.0,
                maximum_interval_ms: 1_000,
                maximum_attempts: 0,
            },
            worker: WorkerConfig {
                poll_timeout_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.task_queue.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker.max_concurrent_workflow_tasks, 2);
        assert!(matches!(config.store, StoreConfig::Memory));
        assert_eq!(config.activity.retry_policy().maximum_attempts, 0);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.events.capacity, 1024);
    }

    #[test]
    fn test_load_from_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[worker]\nmax_concurrent_activity_tasks = 8\n").unwrap();
        writeln!(file, "[logging]\njson = true").unwrap();

        let config = EngineConfig::load(path.to_str()).unwrap();
        assert_eq!(config.worker.max_concurrent_activity_tasks, 8);
        assert_eq!(config.worker.max_concurrent_workflow_tasks, 2);
        assert!(config.logging.json);
    }
}
