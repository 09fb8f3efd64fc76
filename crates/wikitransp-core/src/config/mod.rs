//! Configuration management for wikitransp.
//!
//! Configuration is loaded from the platform config directory with defaults
//! for every field, so an absent or partial file is always usable.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use crate::png::{ClassifierLimits, SizeBounds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Candidate selection and dispatch
    pub scan: ScanConfig,

    /// Network fetch and retries
    pub fetch: FetchConfig,

    /// PNG classifier
    pub classifier: ClassifierConfig,

    /// Ban list
    pub bans: BansConfig,

    /// Accepted-row output
    pub output: OutputConfig,

    /// Run-level limits
    pub limits: LimitsConfig,

    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// - macOS: ~/Library/Application Support/io.github.lmmx.wikitransp/config.toml
    /// - Linux: ~/.config/wikitransp/config.toml
    ///
    /// Falls back to ~/.wikitransp/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("io.github", "lmmx", "wikitransp")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".wikitransp").join("config.toml")
            })
    }

    /// Resolved ban list path (with ~ expansion).
    pub fn ban_list_path(&self) -> PathBuf {
        let path_str = self.bans.path.to_string_lossy();
        PathBuf::from(shellexpand::tilde(&path_str).into_owned())
    }

    pub fn size_bounds(&self) -> SizeBounds {
        SizeBounds::new(self.scan.min_size, self.scan.max_size)
    }

    pub fn classifier_limits(&self) -> ClassifierLimits {
        ClassifierLimits {
            max_image_data_bytes: self.classifier.max_image_data_bytes,
            max_row_bytes: self.classifier.max_row_bytes,
        }
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Write the default configuration to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::default().to_toml()?)?;
        Ok(())
    }
}
