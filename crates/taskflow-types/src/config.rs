//! Configuration types for Taskflow.
//!
//! `TaskflowConfig` represents the top-level `config.toml`. Every section and
//! field has a default, so an empty file (or no file) is a valid config.

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `~/.taskflow/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Workflow engine limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Live instances allowed at once; the next `execute` is rejected.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Per-attempt timeout for steps that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_ms: Option<u64>,
    /// Finished instances kept queryable before the oldest is evicted.
    #[serde(default = "default_max_retained_instances")]
    pub max_retained_instances: usize,
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_max_retained_instances() -> usize {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_step_timeout_ms: None,
            max_retained_instances: default_max_retained_instances(),
        }
    }
}

/// Rollback manager limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackConfig {
    /// Checkpoints kept per manager; oldest evicted first.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    #[serde(default = "default_true")]
    pub enable_history: bool,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

fn default_max_checkpoints() -> usize {
    50
}

fn default_max_history_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: default_max_checkpoints(),
            enable_history: true,
            max_history_size: default_max_history_size(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub enable_otel: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            enable_otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = TaskflowConfig::default();
        assert_eq!(config.engine.max_concurrent_workflows, 10);
        assert_eq!(config.engine.max_retained_instances, 1_000);
        assert!(config.engine.default_step_timeout_ms.is_none());
        assert_eq!(config.rollback.max_checkpoints, 50);
        assert!(config.rollback.enable_history);
        assert_eq!(config.rollback.max_history_size, 100);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config: TaskflowConfig = toml::from_str("").unwrap();
        assert_eq!(config, TaskflowConfig::default());
    }

    #[test]
    fn test_config_deserialize_partial_sections() {
        let toml_str = r#"
[engine]
max_concurrent_workflows = 2
default_step_timeout_ms = 5000

[rollback]
enable_history = false

[logging]
level = "taskflow_core=debug"
json = true
"#;
        let config: TaskflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_concurrent_workflows, 2);
        assert_eq!(config.engine.default_step_timeout_ms, Some(5000));
        assert_eq!(config.engine.max_retained_instances, 1_000);
        assert!(!config.rollback.enable_history);
        assert_eq!(config.rollback.max_checkpoints, 50);
        assert_eq!(config.logging.level, "taskflow_core=debug");
        assert!(config.logging.json);
        assert!(!config.logging.enable_otel);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = TaskflowConfig::default();
        config.rollback.max_checkpoints = 5;
        let serialized = toml::to_string(&config).unwrap();
        let parsed: TaskflowConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed, config);
    }
}
