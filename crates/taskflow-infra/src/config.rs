//! Configuration loader for Taskflow.
//!
//! Reads `config.toml` from the data directory (`~/.taskflow/` unless
//! `TASKFLOW_DATA_DIR` is set) into [`TaskflowConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use taskflow_types::config::TaskflowConfig;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults, logged at debug.
/// - Unreadable or unparsable file: defaults, logged as a warning.
pub async fn load_config(data_dir: &Path) -> TaskflowConfig {
    load_config_file(&data_dir.join(CONFIG_FILE_NAME)).await
}

/// Load configuration from an explicit file path.
pub async fn load_config_file(config_path: &Path) -> TaskflowConfig {
    let content = match tokio::fs::read_to_string(config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", config_path.display());
            return TaskflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return TaskflowConfig::default();
        }
    };

    match toml::from_str::<TaskflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            TaskflowConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// Priority: `TASKFLOW_DATA_DIR`, then `~/.taskflow`, then `./.taskflow`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TASKFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".taskflow");
    }
    PathBuf::from(".taskflow")
}

/// Where checkpoint files live under a data directory.
pub fn checkpoint_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("checkpoints")
}
