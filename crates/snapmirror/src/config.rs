//! Configuration module for the mirroring daemon.
//!
//! Supports YAML configuration files with module-based organization.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Simulated primary workload configuration
    #[serde(default)]
    pub workload: WorkloadConfig,
    /// Supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workload: WorkloadConfig::default(),
            supervisor: SupervisorConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: Config) {
        self.workload.merge(other.workload);
        self.supervisor.merge(other.supervisor);
        self.log.merge(other.log);
    }
}

/// Simulated primary workload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Object size in bytes
    #[serde(default = "default_object_size")]
    pub object_size: usize,
    /// Number of objects in the image
    #[serde(default = "default_object_count")]
    pub object_count: u64,
    /// Delay between object writes in milliseconds
    #[serde(default = "default_write_interval_ms")]
    pub write_interval_ms: u64,
    /// Delay between mirror snapshots in milliseconds
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// Number of mirror snapshots to produce before demoting
    #[serde(default = "default_snapshot_count")]
    pub snapshot_count: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            object_size: default_object_size(),
            object_count: default_object_count(),
            write_interval_ms: default_write_interval_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            snapshot_count: default_snapshot_count(),
        }
    }
}

impl WorkloadConfig {
    fn merge(&mut self, other: Self) {
        if other.object_size > 0 {
            self.object_size = other.object_size;
        }
        if other.object_count > 0 {
            self.object_count = other.object_count;
        }
        if other.write_interval_ms > 0 {
            self.write_interval_ms = other.write_interval_ms;
        }
        if other.snapshot_interval_ms > 0 {
            self.snapshot_interval_ms = other.snapshot_interval_ms;
        }
        if other.snapshot_count > 0 {
            self.snapshot_count = other.snapshot_count;
        }
    }

    /// Get write interval as Duration
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    /// Get snapshot interval as Duration
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum replayer restarts after transient errors
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,
    /// Delay before restarting a failed replayer in milliseconds
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_limit: default_restart_limit(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

impl SupervisorConfig {
    fn merge(&mut self, other: Self) {
        if other.restart_limit > 0 {
            self.restart_limit = other.restart_limit;
        }
        if other.restart_backoff_ms > 0 {
            self.restart_backoff_ms = other.restart_backoff_ms;
        }
    }

    /// Get restart backoff as Duration
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_object_size() -> usize {
    4096
}

fn default_object_count() -> u64 {
    64
}

fn default_write_interval_ms() -> u64 {
    10
}

fn default_snapshot_interval_ms() -> u64 {
    200
}

fn default_snapshot_count() -> u32 {
    5
}

fn default_restart_limit() -> u32 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_yaml("workload:\n  snapshot_count: 9\n").unwrap();
        assert_eq!(config.workload.snapshot_count, 9);
        assert_eq!(config.workload.object_size, default_object_size());
        assert_eq!(config.supervisor.restart_limit, default_restart_limit());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.workload.snapshot_count = 12;
        other.log.level = "debug".to_string();
        base.merge(other);
        assert_eq!(base.workload.snapshot_count, 12);
        assert_eq!(base.log.level, "debug");
    }
}
