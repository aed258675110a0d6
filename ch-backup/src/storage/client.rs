//! Storage client used by the coordinators.
//!
//! Wraps an [`ObjectStore`] with the chunk codec, bounded retries and
//! multipart splitting for payloads larger than `storage.chunk_size`.

use super::{open_store, CompletedPart, ObjectInfo, ObjectStore};
use crate::codec::Codec;
use crate::config::Config;
use crate::utils::errors::{BackupError, Result, StorageError};
use crate::utils::retry::{with_retry, RetryPolicy};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// S3 rejects part numbers above this
const MAX_PARTS: usize = 10_000;

#[derive(Clone)]
pub struct StorageClient {
    store: Arc<dyn ObjectStore>,
    codec: Codec,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl StorageClient {
    pub fn new(store: Arc<dyn ObjectStore>, codec: Codec, retry: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            store,
            codec,
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = open_store(&config.storage).await?;
        Ok(Self::new(
            store,
            Codec::from_config(config)?,
            config.storage.retry_policy(),
            config.storage.chunk_size,
        ))
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Encode `plaintext` and store it under `key`. Returns the stored size.
    pub async fn put_encoded(&self, key: &str, plaintext: Bytes) -> Result<u64> {
        let codec = self.codec.clone();
        let encoded = tokio::task::spawn_blocking(move || codec.encode(&plaintext))
            .await
            .map_err(|e| BackupError::Codec(format!("encoder task failed: {e}")))??;

        let size = encoded.len() as u64;
        self.put_raw(key, Bytes::from(encoded)).await?;
        Ok(size)
    }

    /// Fetch `key` and strip the envelope.
    pub async fn get_decoded(&self, key: &str) -> Result<Vec<u8>> {
        let data = self.get_raw(key).await?;
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || codec.decode(&data))
            .await
            .map_err(|e| BackupError::Codec(format!("decoder task failed: {e}")))?
    }

    /// Store bytes as-is, switching to multipart above the chunk size.
    pub async fn put_raw(&self, key: &str, data: Bytes) -> Result<()> {
        if data.len() > self.chunk_size {
            return self.put_multipart(key, data).await;
        }

        let store = &self.store;
        with_retry(&self.retry, "put", || store.put(key, data.clone())).await?;
        debug!(key, size = data.len(), "Stored object");
        Ok(())
    }

    /// Conditional create of a small object. A retry after a lost response
    /// may see its own earlier write, so `false` means "someone else's
    /// object or ours", and callers compare the contents.
    pub async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool> {
        let store = &self.store;
        let created = with_retry(&self.retry, "put_if_absent", || store.put_if_absent(key, data.clone())).await?;
        debug!(key, created, "Conditional put");
        Ok(created)
    }

    pub async fn get_raw(&self, key: &str) -> Result<Bytes> {
        let store = &self.store;
        Ok(with_retry(&self.retry, "get", || store.get(key)).await?)
    }

    pub async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let store = &self.store;
        Ok(with_retry(&self.retry, "head", || store.head(key)).await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let store = &self.store;
        Ok(with_retry(&self.retry, "list", || store.list(prefix)).await?)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let store = &self.store;
        with_retry(&self.retry, "delete", || store.delete(key)).await?;
        debug!(key, "Deleted object");
        Ok(())
    }

    async fn put_multipart(&self, key: &str, data: Bytes) -> Result<()> {
        let part_count = data.len().div_ceil(self.chunk_size);
        if part_count > MAX_PARTS {
            return Err(BackupError::Configuration(format!(
                "{key} needs {part_count} parts, raise storage.chunk_size"
            )));
        }

        let store = &self.store;
        let upload_id = with_retry(&self.retry, "create_multipart", || store.create_multipart(key)).await?;
        debug!(key, upload_id, parts = part_count, "Started multipart upload");

        match self.upload_parts(key, &upload_id, &data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = store.abort_multipart(key, &upload_id).await {
                    warn!(key, upload_id, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, data: &Bytes) -> Result<()> {
        let store = &self.store;
        let mut parts = Vec::new();

        for (index, offset) in (0..data.len()).step_by(self.chunk_size).enumerate() {
            let end = (offset + self.chunk_size).min(data.len());
            let piece = data.slice(offset..end);
            let part_number = u16::try_from(index + 1)
                .map_err(|_| BackupError::Configuration(format!("{key}: too many multipart parts")))?;

            let etag = with_retry(&self.retry, "upload_part", || {
                store.upload_part(key, upload_id, part_number, piece.clone())
            })
            .await?;
            parts.push(CompletedPart { part_number, etag });
        }

        let expected_size = data.len() as u64;
        let attempts = AtomicU32::new(0);
        let parts = &parts;
        with_retry(&self.retry, "complete_multipart", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match store.complete_multipart(key, upload_id, parts).await {
                    // An earlier attempt may have committed before its response was lost.
                    Err(e) if e.is_not_found() && attempt > 1 => committed_size_matches(store, key, expected_size, e).await,
                    other => other,
                }
            }
        })
        .await?;

        debug!(key, upload_id, parts = parts.len(), "Completed multipart upload");
        Ok(())
    }
}

async fn committed_size_matches(
    store: &Arc<dyn ObjectStore>,
    key: &str,
    expected: u64,
    original: StorageError,
) -> std::result::Result<(), StorageError> {
    match store.head(key).await? {
        Some(info) if info.size == expected => {
            debug!(key, "Multipart upload was already committed");
            Ok(())
        }
        _ => Err(original),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encryption::Cipher;
    use crate::config::{CompressionType, EncryptionConfig, EncryptionType};
    use crate::storage::memory::MemoryStore;
    use std::time::Duration;

    fn client(store: Arc<MemoryStore>, chunk_size: usize) -> StorageClient {
        let cipher = Cipher::from_config(&EncryptionConfig {
            kind: EncryptionType::Nacl,
            key: Some("k".repeat(32)),
            chunk_size: 64,
        })
        .unwrap();
        let retry = RetryPolicy {
            max_attempts: 4,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        };
        StorageClient::new(store, Codec::new(CompressionType::Zstd, 3, cipher, 64), retry, chunk_size)
    }

    #[tokio::test]
    async fn test_encoded_round_trip_is_encrypted_at_rest() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store.clone(), 1024);

        let data = Bytes::from_static(b"clickhouse column bytes");
        client.put_encoded("chunks/aa/aa", data.clone()).await.unwrap();

        let raw = store.get("chunks/aa/aa").await.unwrap();
        assert!(!raw.windows(data.len()).any(|w| w == &data[..]));
        assert_eq!(client.get_decoded("chunks/aa/aa").await.unwrap(), data.to_vec());
    }

    #[tokio::test]
    async fn test_large_payload_uses_multipart() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store.clone(), 10);

        let data = Bytes::from((0u8..=255).collect::<Vec<_>>());
        client.put_raw("big", data.clone()).await.unwrap();

        assert_eq!(store.get("big").await.unwrap(), data);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store.clone(), 1024);

        store.fail_next(2);
        client.put_raw("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(client.get_raw("k").await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_retried_commit_after_lost_response_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store.clone(), 4);

        store.lose_next_complete_response();
        let data = Bytes::from_static(b"0123456789abcdef");
        client.put_raw("obj", data.clone()).await.unwrap();

        assert_eq!(store.get("obj").await.unwrap(), data);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store, 1024);

        let err = client.get_raw("nope").await.unwrap_err();
        assert!(matches!(err, BackupError::Storage(ref e) if e.is_not_found()));
        assert!(!client.exists("nope").await.unwrap());
    }
}
