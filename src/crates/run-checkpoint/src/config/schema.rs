//! Settings schema

use crate::error::{CheckpointError, Result};
use crate::retry::RetryPolicy;
use crate::scheduler::AutoCheckpointConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root settings document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckpointSettings {
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub restore: RestoreSettings,

    #[serde(default)]
    pub locking: LockingSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Defaults for runs that have not been configured explicitly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Turn auto checkpoints on for every run the service sees
    pub enabled_by_default: bool,

    /// Interval used when enabling without an explicit one (60-3600)
    pub default_interval_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled_by_default: false,
            default_interval_seconds: 300,
        }
    }
}

/// Retry of the invalidation step of a restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSettings {
    pub invalidation_max_attempts: usize,
    pub invalidation_initial_backoff_ms: u64,
    pub invalidation_backoff_factor: f64,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            invalidation_max_attempts: 3,
            invalidation_initial_backoff_ms: 100,
            invalidation_backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingSettings {
    /// How long a manual create or a restore waits for the run lock
    pub acquire_timeout_ms: u64,
}

impl Default for LockingSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,

    /// Data directory, relative to ~/.checkpoint unless absolute.
    /// Supports `${VAR}`.
    pub data_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// "trace", "debug", "info", "warn" or "error"
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl CheckpointSettings {
    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        AutoCheckpointConfig::validate_interval(self.scheduler.default_interval_seconds)?;

        if self.restore.invalidation_max_attempts == 0 {
            return Err(CheckpointError::Validation(
                "restore.invalidation_max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.restore.invalidation_backoff_factor >= 1.0) {
            return Err(CheckpointError::Validation(format!(
                "restore.invalidation_backoff_factor must be >= 1.0, got {}",
                self.restore.invalidation_backoff_factor
            )));
        }
        if self.locking.acquire_timeout_ms == 0 {
            return Err(CheckpointError::Validation(
                "locking.acquire_timeout_ms must be positive".to_string(),
            ));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(CheckpointError::Validation(
                "storage.data_dir must not be empty".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(CheckpointError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                LOG_LEVELS, self.logging.level
            )));
        }
        Ok(())
    }

    /// Apply `CHECKPOINT_DATA_DIR` and `CHECKPOINT_LOG_LEVEL`, then expand `${VAR}` values.
    pub fn resolve_env_vars(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("CHECKPOINT_DATA_DIR").filter(|v| !v.is_empty()) {
            self.storage.data_dir = dir;
        }
        if let Some(level) = lookup("CHECKPOINT_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.logging.level = level;
        }
        self.storage.data_dir = expand_env_var(&self.storage.data_dir, &lookup);
    }

    /// Resolved data directory
    pub fn data_path(&self) -> PathBuf {
        let dir = PathBuf::from(&self.storage.data_dir);
        if dir.is_absolute() {
            return dir;
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".checkpoint")
            .join(dir)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locking.acquire_timeout_ms)
    }

    /// Retry policy for the invalidation step of a restore
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.restore.invalidation_max_attempts)
            .with_initial_backoff(Duration::from_millis(
                self.restore.invalidation_initial_backoff_ms,
            ))
            .with_backoff_factor(self.restore.invalidation_backoff_factor)
    }

    /// Schedule applied to runs that were never configured, if any
    pub fn default_auto_checkpoint(&self) -> Option<AutoCheckpointConfig> {
        self.scheduler.enabled_by_default.then_some(AutoCheckpointConfig {
            enabled: true,
            interval_seconds: self.scheduler.default_interval_seconds,
        })
    }
}

/// Expand a whole-value `${VAR_NAME}` reference; anything else is returned as is.
fn expand_env_var(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(name) => lookup(name).unwrap_or_else(|| value.to_string()),
        None => value.to_string(),
    }
}
