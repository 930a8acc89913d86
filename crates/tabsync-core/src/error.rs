//! Error types for tabsync-core

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for tabsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for store, journal, and view operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// The underlying SQLite store rejected an operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// A row addressed by key does not exist
    #[error("Item not found: {0}")]
    NotFound(String),

    /// A row with the same key already exists
    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    /// The change journal could not be read or written
    #[error("Journal error: {0}")]
    Journal(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration failed to load or validate
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Filesystem error while preparing the store location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this error came from a uniqueness conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::AlreadyExists(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::NotFound("abc".into());
        assert!(err.to_string().contains("not found"));

        let err = SyncError::Journal("cursor ahead of head".into());
        assert!(err.to_string().contains("cursor"));
    }

    #[test]
    fn sqlite_errors_map_to_storage() {
        let err: SyncError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn config_errors_convert() {
        let err: SyncError = ConfigError::MissingField("store.path".into()).into();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(err.to_string().contains("store.path"));
    }
}
