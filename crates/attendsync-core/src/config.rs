//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the service base URL, an optional bearer token, the
//! marker identity recorded on each entry, and the sync tuning knobs.
//!
//! Configuration is stored at `~/.config/attendsync/config.json`.
//! `ATTENDSYNC_API_URL`, `ATTENDSYNC_TOKEN` and `ATTENDSYNC_MARKER`
//! override the file when set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_STALE_MINUTES;
use crate::sync::SyncOptions;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "attendsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Database file name inside the data directory
const DATABASE_FILE: &str = "attendsync.db";

const ENV_API_URL: &str = "ATTENDSYNC_API_URL";
const ENV_TOKEN: &str = "ATTENDSYNC_TOKEN";
const ENV_MARKER: &str = "ATTENDSYNC_MARKER";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    /// Identity stamped as `markedBy` on new entries.
    pub marker_id: Option<String>,
    /// Overrides the default database location.
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub submit_timeout_secs: u64,
    pub drain_interval_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub max_consecutive_failures: u32,
    pub cache_stale_minutes: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let options = SyncOptions::default();
        Self {
            submit_timeout_secs: options.submit_timeout.as_secs(),
            drain_interval_secs: options.drain_interval.as_secs(),
            initial_backoff_ms: options.initial_backoff.as_millis() as u64,
            max_backoff_secs: options.max_backoff.as_secs(),
            max_consecutive_failures: options.max_consecutive_failures,
            cache_stale_minutes: DEFAULT_STALE_MINUTES,
        }
    }
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            submit_timeout: Duration::from_secs(settings.submit_timeout_secs.max(1)),
            drain_interval: Duration::from_secs(settings.drain_interval_secs.max(1)),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match self.database_path {
            Some(ref path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join(DATABASE_FILE)),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions::from(&self.sync)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_API_URL) {
            self.api_base_url = Some(url);
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            self.api_token = Some(token);
        }
        if let Some(marker) = non_empty(ENV_MARKER) {
            self.marker_id = Some(marker);
        }
    }
}
