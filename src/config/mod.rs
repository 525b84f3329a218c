//! Cluster configuration file
//!
//! ```yaml
//! cluster:
//!   name: homelab
//!   proxmox_host: 10.0.0.1
//!   nodes:
//!     - name: brian
//!       host: 10.0.0.10
//!       online: true
//!       capabilities: [llm-inference, training]
//!       accelerators:
//!         - { type: nvidia, model: RTX 3090, count: 3, vram_gb: 24 }
//! scheduler:
//!   queue_capacity: 1024
//!   workers: 2
//!   max_snapshot_age_secs: 120
//!   refresh_interval_secs: 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::{ClusterSpec, TopologyError};
use crate::scheduler::{
    QueueConfig, ScoringWeights, DEFAULT_MAX_SNAPSHOT_AGE_SECS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKERS, WARM_MODEL_BONUS,
};
use crate::telemetry::{RefresherConfig, REFRESH_INTERVAL_SECS};

/// Default config file location: ~/.pve-orch/cluster.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pve-orch")
        .join("cluster.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// The complete configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub cluster: ClusterSpec,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl OrchestratorConfig {
    pub fn new(cluster: ClusterSpec) -> Self {
        Self {
            cluster,
            scheduler: SchedulerSettings::default(),
        }
    }
}

/// Dispatch queue and refresher tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Bound on waiting tasks; `null` for unbounded
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: Option<usize>,

    /// Routing workers draining the queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Oldest snapshot the router accepts; `null` disables the check
    #[serde(default = "default_max_snapshot_age_secs")]
    pub max_snapshot_age_secs: Option<u64>,

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_warm_model_bonus")]
    pub warm_model_bonus: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            max_snapshot_age_secs: default_max_snapshot_age_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            warm_model_bonus: default_warm_model_bonus(),
        }
    }
}

fn default_queue_capacity() -> Option<usize> {
    Some(DEFAULT_QUEUE_CAPACITY)
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_max_snapshot_age_secs() -> Option<u64> {
    Some(DEFAULT_MAX_SNAPSHOT_AGE_SECS)
}

fn default_refresh_interval_secs() -> u64 {
    REFRESH_INTERVAL_SECS
}

fn default_warm_model_bonus() -> f64 {
    WARM_MODEL_BONUS
}

impl SchedulerSettings {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            queue_capacity: self.queue_capacity,
            max_snapshot_age: self.max_snapshot_age_secs.map(Duration::from_secs),
            scoring: ScoringWeights {
                warm_model_bonus: self.warm_model_bonus,
            },
        }
    }

    pub fn refresher_config(&self) -> RefresherConfig {
        RefresherConfig::default().with_interval(self.refresh_interval_secs)
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse and validate config from a YAML string
pub fn parse_config(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Serialize config to YAML
pub fn serialize_config(config: &OrchestratorConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::WriteError(e.to_string()))
}

pub fn validate_config(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    config.cluster.validate()?;

    let scheduler = &config.scheduler;
    if scheduler.workers == 0 {
        return Err(ConfigError::Invalid("scheduler.workers must be at least 1".into()));
    }
    if scheduler.queue_capacity == Some(0) {
        return Err(ConfigError::Invalid(
            "scheduler.queue_capacity must be at least 1 (or null for unbounded)".into(),
        ));
    }
    if scheduler.refresh_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.refresh_interval_secs must be at least 1".into(),
        ));
    }
    if !scheduler.warm_model_bonus.is_finite() {
        return Err(ConfigError::Invalid(
            "scheduler.warm_model_bonus must be a finite number".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a config file from disk
pub fn load_config_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Write config to `path`, creating parent directories
pub fn save_config_to(config: &OrchestratorConfig, path: &Path) -> Result<(), ConfigError> {
    validate_config(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
