//! Arbor Configuration Module
//!
//! Persistent CLI configuration in `~/.config/arbor/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`ARBOR_TRACE_DIR`, `ARBOR_LOG`)
//! 2. Config file (`~/.config/arbor/config.toml`)
//! 3. Defaults

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArborConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

/// Default settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    /// Directory event traces are written into (`arbor run --trace`)
    pub trace_dir: Option<String>,
    /// Default tracing filter when RUST_LOG is unset
    pub log: Option<String>,
}

impl ArborConfig {
    /// `~/.config/arbor/` on Unix, `%APPDATA%/arbor/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arbor")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration; a missing file is the default config, a
    /// malformed one is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| ArborError::Config {
            reason: format!("failed to read config file: {e}"),
        })?;
        toml::from_str(&content).map_err(|e| ArborError::Config {
            reason: format!("failed to parse config file: {e}"),
        })
    }

    /// Save configuration, creating the directory if needed
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| ArborError::Config {
                reason: format!("failed to create config directory: {e}"),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ArborError::Config {
            reason: format!("failed to serialize config: {e}"),
        })?;
        fs::write(Self::config_path(), content).map_err(|e| ArborError::Config {
            reason: format!("failed to write config file: {e}"),
        })
    }

    /// Environment variables take precedence over file values
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("ARBOR_TRACE_DIR") {
            if !dir.is_empty() {
                self.defaults.trace_dir = Some(dir);
            }
        }
        if let Ok(log) = std::env::var("ARBOR_LOG") {
            if !log.is_empty() {
                self.defaults.log = Some(log);
            }
        }
        self
    }
}
