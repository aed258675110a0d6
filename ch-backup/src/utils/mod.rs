//! Utility modules shared by the coordinators and the CLI.

pub mod errors;
pub mod logger;
pub mod retry;
pub mod shutdown;

pub use errors::{BackupError, Result, StorageError};
