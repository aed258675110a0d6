//! ch-backup library
//!
//! Deduplicating backup and restore of ClickHouse data parts to
//! S3-compatible object storage.

pub mod clickhouse;
pub mod codec;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod fs;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result, StorageError};
