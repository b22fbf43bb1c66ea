//! Configuration loader with layered locations
//!
//! Loads configuration from:
//! 1. Default values
//! 2. User-level config: ~/.checkpoint/checkpoint.toml
//! 3. Project-level config: ./.checkpoint/checkpoint.toml
//! 4. Environment overrides
//!
//! Files are merged key by key, so a project file that only sets `[locking]` keeps the
//! user's `[scheduler]` section.

use super::schema::CheckpointSettings;
use crate::error::{CheckpointError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const CONFIG_DIR: &str = ".checkpoint";
const CONFIG_FILE: &str = "checkpoint.toml";

/// Loads [`CheckpointSettings`] from user and project files
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
    project_config_path: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            user_config_path: dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE)),
            project_config_path: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(CONFIG_DIR)
                .join(CONFIG_FILE),
        }
    }

    /// Loader reading explicit files instead of the default locations
    pub fn with_paths(user: Option<PathBuf>, project: impl Into<PathBuf>) -> Self {
        Self {
            user_config_path: user,
            project_config_path: project.into(),
        }
    }

    /// Load and validate settings, project file taking precedence over the user file
    pub async fn load(&self) -> Result<CheckpointSettings> {
        let mut merged = toml::Value::try_from(CheckpointSettings::default())
            .map_err(|e| CheckpointError::Config(format!("Failed to encode defaults: {}", e)))?;

        let layers = self
            .user_config_path
            .iter()
            .map(|p| ("user", p.as_path()))
            .chain(std::iter::once(("project", self.project_config_path.as_path())));

        for (layer, path) in layers {
            match Self::read_layer(path).await? {
                Some(value) => {
                    debug!(layer, path = %path.display(), "Loaded config layer");
                    merge_values(&mut merged, value);
                }
                None => debug!(layer, path = %path.display(), "Config file not found"),
            }
        }

        let mut settings: CheckpointSettings = merged
            .try_into()
            .map_err(|e| CheckpointError::Config(format!("Invalid configuration: {}", e)))?;
        settings.resolve_env_vars();
        settings.validate()?;

        info!(
            backend = ?settings.storage.backend,
            data_dir = %settings.data_path().display(),
            "Configuration loaded"
        );
        Ok(settings)
    }

    /// Parse one file; `Ok(None)` when it does not exist
    async fn read_layer(path: &Path) -> Result<Option<toml::Value>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let value: toml::Value = toml::from_str(&content).map_err(|e| {
            CheckpointError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }

    pub fn user_config_path(&self) -> Option<&Path> {
        self.user_config_path.as_deref()
    }

    pub fn project_config_path(&self) -> &Path {
        &self.project_config_path
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Overlay `overlay` onto `base`; tables merge recursively, everything else is replaced.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
