//! Persisted settings record.
//!
//! A single TOML file holding `{ role, current_profile }`. No session
//! history is kept. A missing file yields defaults; corruption is a
//! fatal error surfaced to the operator rather than silently reset.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tact::role::Role;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(String),

    #[error("failed to write settings: {0}")]
    Write(String),

    #[error("settings file corrupt: {0}")]
    Corrupt(String),
}

/// The persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub role: Role,
    pub current_profile: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            current_profile: "default".to_string(),
        }
    }
}

impl Settings {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(SettingsError::Read(err.to_string())),
        };
        toml::from_str(&text).map_err(|e| SettingsError::Corrupt(e.to_string()))
    }

    /// Write to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Write(e.to_string()))?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| SettingsError::Write(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| SettingsError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let settings = Settings {
            role: Role::Secondary,
            current_profile: "evening".to_string(),
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "role = 7\n").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(SettingsError::Corrupt(_))
        ));
    }
}
