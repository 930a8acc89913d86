//! Configuration for tabsync-core
//!
//! Store location, notification bus timing, and the channel naming strategy
//! shared by every context that opens the same store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelNaming;

/// File name used when no store path is configured.
pub const DEFAULT_DB_FILENAME: &str = "crosstab-repro.db";

/// Top-level configuration for a context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fixed identifier for this context; random when absent
    pub tab_id: Option<String>,
    /// Persistent store settings
    pub store: StoreConfig,
    /// Notification bus settings
    pub bus: BusConfig,
}

/// Persistent store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the shared SQLite file
    pub path: PathBuf,
    /// How long a writer waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Notification bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How channel labels are derived from table names
    pub naming: ChannelNaming,
    /// Interval between journal polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum journal entries read per poll
    pub max_batch: usize,
    /// Journal entries kept when pruning; `pump` prunes each time this many
    /// new entries have been read
    pub journal_retention: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            naming: ChannelNaming::SchemaDerived,
            poll_interval_ms: 100,
            max_batch: 256,
            journal_retention: 10_000,
        }
    }
}

/// Default store location under the platform's local data directory.
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tabsync")
        .join(DEFAULT_DB_FILENAME)
}

impl SyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, pointed at a specific store file
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.store.path = path.into();
        config
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a config file, picking the format from its extension.
    ///
    /// `.json` files are read as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text)?,
            _ => Self::from_toml(&text)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("store.path".to_string()));
        }

        if self.bus.poll_interval_ms == 0 {
            return Err(ConfigError::OutOfRange(
                "bus.poll_interval_ms must be positive".to_string(),
            ));
        }

        if self.bus.max_batch == 0 {
            return Err(ConfigError::OutOfRange(
                "bus.max_batch must be positive".to_string(),
            ));
        }

        if self.bus.journal_retention == 0 {
            return Err(ConfigError::OutOfRange(
                "bus.journal_retention must keep at least one entry".to_string(),
            ));
        }

        if let Some(tab_id) = &self.tab_id {
            if tab_id.trim().is_empty() {
                return Err(ConfigError::MissingField("tab_id".to_string()));
            }
        }

        Ok(())
    }
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Value is out of valid range
    #[error("Value out of range: {0}")]
    OutOfRange(String),
    /// Required field is missing or empty
    #[error("Missing field: {0}")]
    MissingField(String),
    /// Text could not be parsed or produced
    #[error("Parse error: {0}")]
    Parse(String),
}
