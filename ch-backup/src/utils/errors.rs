//! Error types for backup and restore operations.

use thiserror::Error;

/// Failure of a single object-storage call.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Transient storage error on {key}: {message}")]
    Transient { key: String, message: String },

    #[error("Storage error on {key}: {message}")]
    Permanent { key: String, message: String },
}

impl StorageError {
    pub fn transient(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Transient {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn permanent(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Permanent {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Only network-level and server-side failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Validation failed for {key}: expected {expected}, got {actual}")]
    Validation {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to attach part {part} of {table}: {reason}")]
    Attach {
        table: String,
        part: String,
        reason: String,
    },

    #[error("Backup {name} failed: {source}")]
    BackupFailed {
        name: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Restore of {name} failed: {reason}")]
    RestoreFailed { name: String, reason: String },

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Manifest of backup {name} is unreadable: {reason}")]
    UnreadableManifest { name: String, reason: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("ClickHouse error: {0}")]
    Clickhouse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Wrap an error raised while a backup was in progress.
    pub fn backup_failed(name: impl Into<String>, source: BackupError) -> Self {
        match source {
            already @ BackupError::BackupFailed { .. } => already,
            other => BackupError::BackupFailed {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn restore_failed(name: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::RestoreFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(err: config::ConfigError) -> Self {
        BackupError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
