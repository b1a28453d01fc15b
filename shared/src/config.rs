//! Configuration management (`config.toml` in the platform config directory)
//!
//! Handles loading, saving, and providing defaults for launcher settings.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::netplay::NetplaySettings;

/// File name of the configuration file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while reading or writing the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("no platform config directory available")]
    NoConfigDir,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub netplay: NetplaySettings,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    /// Where persistent save memory is stored (default: data dir)
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
}

/// Platform config directory (e.g. `~/.config/lockstep` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lockstep").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Platform data directory, used for save files when not configured.
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lockstep").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default path of `config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

impl AppConfig {
    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_config_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load from `path`. A missing file yields the default config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = default_config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Directory for save files: configured value, else the data dir.
    pub fn save_dir(&self) -> Option<PathBuf> {
        self.paths.save_dir.clone().or_else(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netplay::{PeerMode, Role};

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = AppConfig::default();
        config.netplay.role = Role::Joiner;
        config.netplay.peer = PeerMode::Static {
            host: "192.168.1.20".to_string(),
            port: 7000,
        };
        config.netplay.shared_secret = Some("hunter2".to_string());
        config.paths.save_dir = Some(PathBuf::from("/tmp/saves"));

        config.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[netplay\nrole = ").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_empty_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "").unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());
    }
}
