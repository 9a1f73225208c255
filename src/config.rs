//! Settings file
//!
//! Every field has a default, so an empty `{}` file (or no file at all) is a
//! valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::queue::{ExecutionOptions, DEFAULT_LOG_CAPACITY};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    pub default_parallel_limit: usize,
    pub default_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub log_capacity: usize,
    pub retention_hours: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_parallel_limit: 3,
            default_retry_attempts: 1,
            retry_backoff_ms: 1000,
            log_capacity: DEFAULT_LOG_CAPACITY,
            retention_hours: 24,
            cleanup_interval_secs: 3600,
        }
    }
}

impl MonitorConfig {
    pub fn default_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            parallel_limit: self.default_parallel_limit,
            retry_attempts: self.default_retry_attempts,
            retry_backoff_ms: self.retry_backoff_ms,
        }
        .sanitized()
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Latency and failure profile of the simulated email + AI pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatorConfig {
    /// Inclusive `[min, max]` email send delay in milliseconds
    pub email_delay_ms: (u64, u64),
    /// Inclusive `[min, max]` AI processing delay in milliseconds
    pub ai_delay_ms: (u64, u64),
    pub success_rate: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            email_delay_ms: (1000, 3000),
            ai_delay_ms: (2000, 5000),
            success_rate: 0.9,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid settings file {:?}", path))
    }

    /// Load from `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"server": {"port": 9090}, "simulator": {"successRate": 0.5, "aiDelayMs": [10, 20]}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.simulator.success_rate, 0.5);
        assert_eq!(settings.simulator.ai_delay_ms, (10, 20));
        assert_eq!(settings.simulator.email_delay_ms, (1000, 3000));
        assert_eq!(settings.monitor.log_capacity, 100);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::load(&dir.path().join("absent.json")).is_err());
        assert!(Settings::load_or_default(None).is_ok());
    }

    #[test]
    fn test_default_options_are_sanitized() {
        let config = MonitorConfig {
            default_parallel_limit: 0,
            ..MonitorConfig::default()
        };
        assert_eq!(config.default_options().parallel_limit, 1);
    }
}
