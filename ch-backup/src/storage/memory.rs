//! In-memory object store.
//!
//! Besides backing the `memory` storage type it exposes a few fault-injection
//! knobs so retry, validation and multipart-commit paths can be exercised.

use super::{CompletedPart, ObjectInfo, ObjectStore, StorageResult};
use crate::utils::errors::StorageError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u16, Bytes>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: RwLock<HashMap<String, PendingUpload>>,
    puts: AtomicUsize,
    transient_failures: AtomicU32,
    corrupt_writes: AtomicBool,
    lose_complete_response: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects written (single PUTs and completed multipart uploads)
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Flip a byte in every object written from now on.
    pub fn corrupt_writes(&self, enabled: bool) {
        self.corrupt_writes.store(enabled, Ordering::SeqCst);
    }

    /// Commit the next multipart upload but report a transient failure.
    pub fn lose_next_complete_response(&self) {
        self.lose_complete_response.store(true, Ordering::SeqCst);
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.objects.write().await.remove(key).is_some()
    }

    /// Backdate an object so grace periods can be tested.
    pub async fn set_last_modified(&self, key: &str, when: DateTime<Utc>) {
        if let Some(obj) = self.objects.write().await.get_mut(key) {
            obj.last_modified = when;
        }
    }

    fn injected_failure(&self, key: &str) -> StorageResult<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StorageError::transient(key, "injected failure"));
        }
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes) {
        let data = if self.corrupt_writes.load(Ordering::SeqCst) && !data.is_empty() {
            let mut damaged = BytesMut::from(&data[..]);
            let last = damaged.len() - 1;
            damaged[last] ^= 0xff;
            damaged.freeze()
        } else {
            data
        };

        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.injected_failure(key)?;
        self.store(key, data).await;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        self.injected_failure(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.injected_failure(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        self.injected_failure(key)?;
        Ok(self.objects.read().await.get(key).map(|o| ObjectInfo {
            key: key.to_string(),
            size: o.data.len() as u64,
            last_modified: o.last_modified,
        }))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        self.injected_failure(prefix)?;
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectInfo {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: o.last_modified,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.injected_failure(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        self.injected_failure(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.write().await.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u16, data: Bytes) -> StorageResult<String> {
        self.injected_failure(key)?;
        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::not_found(format!("{key}?uploadId={upload_id}")))?;
        upload.parts.insert(part_number, data);
        Ok(format!("\"part-{part_number}\""))
    }

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> StorageResult<()> {
        self.injected_failure(key)?;
        let upload = self
            .uploads
            .write()
            .await
            .remove(upload_id)
            .ok_or_else(|| StorageError::not_found(format!("{key}?uploadId={upload_id}")))?;

        if upload.key != key {
            return Err(StorageError::permanent(key, "upload belongs to a different key"));
        }

        let mut assembled = BytesMut::new();
        for part in parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StorageError::permanent(key, format!("missing part {}", part.part_number)))?;
            assembled.extend_from_slice(data);
        }
        self.store(key, assembled.freeze()).await;

        if self.lose_complete_response.swap(false, Ordering::SeqCst) {
            return Err(StorageError::transient(key, "connection reset after commit"));
        }
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        self.uploads.write().await.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryStore::new();
        store.put("a/1", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/2", Bytes::from_static(b"two")).await.unwrap();
        store.put("b/1", Bytes::from_static(b"other")).await.unwrap();

        assert_eq!(store.get("a/2").await.unwrap(), Bytes::from_static(b"two"));
        let keys: Vec<String> = store.list("a/").await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_part_order() {
        let store = MemoryStore::new();
        let id = store.create_multipart("big").await.unwrap();
        let e2 = store.upload_part("big", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        let e1 = store.upload_part("big", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();

        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        store.complete_multipart("big", &id, &parts).await.unwrap();

        assert_eq!(store.get("big").await.unwrap(), Bytes::from_static(b"hello world"));
        assert!(store.complete_multipart("big", &id, &parts).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_first_writer() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("lock", Bytes::from_static(b"a")).await.unwrap());
        assert!(!store.put_if_absent("lock", Bytes::from_static(b"b")).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next(1);
        assert!(store.put("k", Bytes::new()).await.unwrap_err().is_retryable());
        store.put("k", Bytes::new()).await.unwrap();
    }
}
