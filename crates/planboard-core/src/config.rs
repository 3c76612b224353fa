//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: where
//! the API lives, how credentials travel, where the session is persisted,
//! and the navigation entry points.
//!
//! Configuration is stored at `~/.config/planboard/config.json`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/data directory paths
const APP_NAME: &str = "planboard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:5001";

/// Login and refresh calls give up after this many seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// How the credential reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    /// Client-visible token sent as `Authorization: Bearer`.
    #[default]
    Bearer,
    /// Server-managed cookie the client never reads.
    Cookie,
}

impl FromStr for CredentialMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bearer" => Ok(CredentialMode::Bearer),
            "cookie" => Ok(CredentialMode::Cookie),
            other => Err(anyhow::anyhow!("Unknown credential mode: {}", other)),
        }
    }
}

/// Where the session record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "keyring" => Ok(StorageBackend::Keyring),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub credential_mode: CredentialMode,
    pub storage: StorageBackend,
    pub request_timeout_secs: u64,
    pub app_name: String,
    pub guest_entry: String,
    pub landing: String,
    pub last_username: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            credential_mode: CredentialMode::default(),
            storage: StorageBackend::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            app_name: "Planboard".to_string(),
            guest_entry: "/login".to_string(),
            landing: "/".to_string(),
            last_username: None,
            log_file: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Record the last signed-in username in the config file. Only that
    /// field changes; environment overrides applied in memory stay out of
    /// the file.
    pub fn remember_username(username: &str) -> Result<()> {
        Self::remember_username_in(&Self::config_path()?, username)
    }

    fn remember_username_in(path: &Path, username: &str) -> Result<()> {
        let mut on_disk = Self::load_from(path)?;
        on_disk.last_username = Some(username.to_string());
        on_disk.save_to(path)
    }

    /// Fails when a persisted session could not be used by a later process.
    /// The cookie jar lives in process memory, so cookie mode only pairs
    /// with the memory backend when every process starts fresh.
    pub fn require_restorable_session(&self) -> Result<()> {
        if self.credential_mode == CredentialMode::Cookie && self.storage != StorageBackend::Memory {
            bail!(
                "Cookie mode needs `storage: memory` here: the session cookie is not kept between runs"
            );
        }
        Ok(())
    }

    /// Apply `PLANBOARD_*` environment overrides. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PLANBOARD_API_URL") {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("PLANBOARD_CREDENTIAL_MODE") {
            match mode.parse() {
                Ok(mode) => self.credential_mode = mode,
                Err(e) => warn!(error = %e, "Ignoring PLANBOARD_CREDENTIAL_MODE"),
            }
        }
        if let Ok(storage) = std::env::var("PLANBOARD_STORAGE") {
            match storage.parse() {
                Ok(storage) => self.storage = storage,
                Err(e) => warn!(error = %e, "Ignoring PLANBOARD_STORAGE"),
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session for the file backend.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
