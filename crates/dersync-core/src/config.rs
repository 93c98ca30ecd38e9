//! Engine configuration, loaded from `<data_dir>/config.toml`.
//!
//! Every field has a default, so an empty or missing file is valid.
//!
//! ```toml
//! device_name = "laptop"
//! collections = ["tasks", "reviews"]
//!
//! [remote]
//! url = "https://records.example.org"
//! request_timeout_secs = 15
//!
//! [notifier]
//! min_publish_interval_ms = 2000
//! history_window_secs = 300
//!
//! [logging]
//! jsonl_dir = "/var/log/dersync"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::Collection;

/// Name of the config file inside the data directory
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding `remote.url`
pub const REMOTE_URL_ENV: &str = "DERSYNC_REMOTE_URL";

/// Default data directory: `~/.dersync/data`
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dersync")
        .join("data")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Human-readable label for this installation (logs only)
    pub device_name: String,
    /// Collections tracked by sync passes
    pub collections: Vec<String>,
    pub remote: RemoteConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the remote record store; `None` means offline
    pub url: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub min_publish_interval_ms: u64,
    pub history_window_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for JSONL sync logs; disabled when unset
    pub jsonl_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            device_name: "default".to_string(),
            collections: vec![Collection::TASKS.to_string()],
            remote: RemoteConfig::default(),
            notifier: NotifierConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: 15,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            min_publish_interval_ms: 2_000,
            history_window_secs: 300,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl NotifierConfig {
    pub fn min_publish_interval(&self) -> Duration {
        Duration::from_millis(self.min_publish_interval_ms)
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> SyncResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SyncError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load_from_file(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Load `<data_dir>/config.toml` if present, else defaults.
    ///
    /// `data_dir` always ends up as the directory passed in, whatever the
    /// file says. The remote URL environment override is applied last.
    pub fn load(data_dir: &Path) -> SyncResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.merge_with_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn merge_with_env(&mut self) {
        if let Ok(url) = std::env::var(REMOTE_URL_ENV) {
            if !url.is_empty() {
                self.remote.url = Some(url);
            }
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.collections.is_empty() {
            return Err(SyncError::Config("at least one collection is required".into()));
        }
        if self.collections.iter().any(|c| c.is_empty()) {
            return Err(SyncError::Config("collection names must not be empty".into()));
        }
        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::Config("remote.request_timeout_secs must be > 0".into()));
        }
        if let Some(url) = &self.remote.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SyncError::Config(format!("remote.url is not http(s): {}", url)));
            }
        }
        Ok(())
    }

    /// Tracked collections as typed tags
    pub fn collection_tags(&self) -> Vec<Collection> {
        self.collections.iter().map(Collection::new).collect()
    }

    /// Path of the redb database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("dersync.redb")
    }

    /// Write the config back as TOML.
    pub fn save(&self) -> SyncResult<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let text = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("failed to encode config: {}", e)))?;
        std::fs::write(self.data_dir.join(CONFIG_FILE), text)?;
        Ok(())
    }
}
