//! Persisted settings record.
//!
//! A small JSON document in the user-data directory that outlives the
//! process. Currently it only remembers a custom environment path when the
//! user pointed the runner at an existing system-level interpreter instead
//! of letting it provision one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";

/// Settings stored in the per-user application data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Interpreter environment chosen by the user, bypassing provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_env_path: Option<PathBuf>,
}

impl Settings {
    /// Load the settings record from `data_dir`, returning defaults when the
    /// file does not exist yet.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::Settings(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Settings(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Write the settings record back to `data_dir`, creating the directory
    /// if necessary.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            Error::Settings(format!("Failed to create {}: {}", data_dir.display(), e))
        })?;
        let path = data_dir.join(SETTINGS_FILE);
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to encode settings: {}", e)))?;
        std::fs::write(&path, raw)
            .map_err(|e| Error::Settings(format!("Failed to write {}: {}", path.display(), e)))
    }
}
