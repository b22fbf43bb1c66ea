//! Configuration management
//!
//! Supports layered configuration:
//! - Built-in defaults
//! - User-level: ~/.checkpoint/checkpoint.toml
//! - Project-level: ./.checkpoint/checkpoint.toml
//! - Environment: `CHECKPOINT_DATA_DIR`, `CHECKPOINT_LOG_LEVEL`
//!
//! Later layers override earlier ones key by key.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    CheckpointSettings, LockingSettings, LoggingSettings, RestoreSettings, SchedulerSettings,
    StorageBackend, StorageSettings,
};

use crate::error::Result;

/// Load settings from every layer
pub async fn load_settings() -> Result<CheckpointSettings> {
    ConfigLoader::new().load().await
}
