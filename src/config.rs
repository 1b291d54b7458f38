//! Configuration for habitat-core.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordination::OrchestratorConfig;
use crate::task::TaskPriority;

/// Habitat configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the event log and position state.
    pub data_dir: PathBuf,
    /// Maximum concurrent executions across all positions.
    pub max_concurrent: usize,
    /// Per-task execution timeout in seconds.
    pub task_timeout_secs: u64,
    /// Priority assigned to tasks that do not specify one.
    pub default_priority: TaskPriority,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("habitat");

        Self {
            data_dir,
            max_concurrent: 5,
            task_timeout_secs: 300,
            default_priority: TaskPriority::Normal,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/habitat/habitat.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("habitat").join("habitat.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./habitat.yml
        let fallback_config = PathBuf::from("habitat.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Directory holding the date-sharded event log.
    pub fn event_log_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    /// Convert to OrchestratorConfig.
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent: self.max_concurrent,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            default_priority: self.default_priority,
        }
    }
}
