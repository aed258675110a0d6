//! Object storage abstraction.
//!
//! [`ObjectStore`] is the thin S3-shaped seam (PUT/GET/HEAD/LIST/DELETE plus
//! multipart upload). Backends:
//! - [`s3::S3Store`] - any S3-compatible endpoint, optionally via a resolved proxy
//! - [`local::LocalStore`] - a directory tree, for single-host setups and tests
//! - [`memory::MemoryStore`] - process memory, with fault injection for tests
//!
//! [`client::StorageClient`] layers the chunk codec, retries and multipart
//! splitting on top of whichever backend is configured.

pub mod client;
pub mod local;
pub mod memory;
pub mod proxy;
pub mod s3;

use crate::config::{StorageConfig, StorageType};
use crate::utils::errors::{BackupError, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use client::StorageClient;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Listing entry for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One uploaded part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u16,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Create `key` only when nothing is stored there yet. Returns `false`
    /// when the object already exists.
    async fn put_if_absent(&self, key: &str, data: Bytes) -> StorageResult<bool>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// `None` when the object does not exist
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>>;

    /// All objects whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;

    /// Deleting a missing object succeeds
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    /// Returns the part's ETag
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u16, data: Bytes) -> StorageResult<String>;

    /// Fails with `NotFound` when the upload id is unknown (e.g. already completed)
    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> StorageResult<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;
}

/// Build the backend selected by `storage.type`.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.kind {
        StorageType::S3 => {
            let proxy = match &config.proxy_resolver {
                Some(resolver) => Some(proxy::ProxyResolver::from_config(resolver).resolve().await?),
                None => None,
            };
            Ok(Arc::new(s3::S3Store::new(config, proxy)?))
        }
        StorageType::Local => {
            let root = config.local_path.clone().ok_or_else(|| {
                BackupError::Configuration("storage.local_path is required for local storage".to_string())
            })?;
            Ok(Arc::new(local::LocalStore::new(root).await?))
        }
        StorageType::Memory => Ok(Arc::new(memory::MemoryStore::new())),
    }
}
