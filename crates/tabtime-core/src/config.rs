//! TabTime configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TabTimeError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabTimeConfig {
    /// Directory holding the sync and local store files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub lock: LockConfig,
    /// How often the store files are checked for edits made by other processes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub tabs: TabsConfig,
}

fn default_data_dir() -> String { "~/.tabtime/data".into() }
fn default_poll_interval_ms() -> u64 { 1_000 }

impl Default for TabTimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            lock: LockConfig::default(),
            tabs: TabsConfig::default(),
        }
    }
}

impl TabTimeConfig {
    /// Load config from the default path (~/.tabtime/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TabTimeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TabTimeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Write config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TabTimeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TabTime home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tabtime")
    }

    /// Data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }
}

/// Advisory storage lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Acquisition attempts before giving up with `LockTimeout`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles after every failed attempt.
    #[serde(default = "default_initial_wait_ms")]
    pub initial_wait_ms: u64,
    /// Age after which a held lock counts as abandoned.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: i64,
}

fn default_max_attempts() -> u32 { 10 }
fn default_initial_wait_ms() -> u64 { 50 }
fn default_stale_after_ms() -> i64 { 15_000 }

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_wait_ms: default_initial_wait_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

/// Headless tab host settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabsConfig {
    /// Command run for every opened URL, URL appended as the last argument
    /// (e.g. "xdg-open" or "firefox --new-tab").
    #[serde(default)]
    pub launcher: Option<String>,
}
