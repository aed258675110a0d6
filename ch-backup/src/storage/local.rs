//! Directory-backed object store.
//!
//! Keys map to paths below the root. Writes go to a temporary sibling and are
//! renamed into place so readers never observe a partial object. Multipart
//! uploads stage their parts under `.multipart/<upload id>/`.

use super::{CompletedPart, ObjectInfo, ObjectStore, StorageResult};
use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::{Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

const MULTIPART_DIR: &str = ".multipart";
const TMP_PREFIX: &str = ".tmp-";
const UPLOAD_KEY_FILE: &str = "key";

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(name) if !name.to_string_lossy().starts_with('.')));
        if !safe {
            return Err(StorageError::permanent(key, "invalid object key"));
        }
        Ok(self.root.join(relative))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    async fn write_atomic(&self, key: &str, path: &Path, parts: &[&[u8]]) -> StorageResult<()> {
        let tmp = self.write_tmp(key, path, parts).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(key, e));
        }
        Ok(())
    }

    /// Write `parts` to a fresh temporary sibling of `path`.
    async fn write_tmp(&self, key: &str, path: &Path, parts: &[&[u8]]) -> StorageResult<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::permanent(key, "object path has no parent"))?;
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(key, e))?;

        let tmp = parent.join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            for part in parts {
                file.write_all(part).await?;
            }
            file.sync_all().await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(key, e));
        }
        Ok(tmp)
    }
}

fn io_error(key: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StorageError::not_found(key),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            StorageError::transient(key, err)
        }
        _ => StorageError::permanent(key, err),
    }
}

fn modified(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.object_path(key)?;
        self.write_atomic(key, &path, &[&data]).await
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let path = self.object_path(key)?;
        let tmp = self.write_tmp(key, &path, &[&data]).await?;
        // link(2) fails instead of replacing an existing target.
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path).await.map(Bytes::from).map_err(|e| io_error(key, e))
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: meta.len(),
                last_modified: modified(&meta),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let options = WalkOptions {
            skip_prefixes: vec![MULTIPART_DIR.to_string(), TMP_PREFIX.to_string()],
            ..Default::default()
        };

        let files = tokio::task::spawn_blocking(move || walk_files(&root, &options))
            .await
            .map_err(|e| StorageError::permanent(prefix, e))?
            .map_err(|e| io_error(prefix, e))?;

        let mut objects = Vec::new();
        for file in files {
            let key = file.relative_key();
            if !key.starts_with(prefix) {
                continue;
            }
            let last_modified = match tokio::fs::metadata(&file.path).await {
                Ok(meta) => modified(&meta),
                // Deleted between the walk and the stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&key, e)),
            };
            objects.push(ObjectInfo {
                key,
                size: file.size,
                last_modified,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        self.object_path(key)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_error(key, e))?;
        tokio::fs::write(dir.join(UPLOAD_KEY_FILE), key.as_bytes())
            .await
            .map_err(|e| io_error(key, e))?;
        Ok(upload_id)
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: u16, data: Bytes) -> StorageResult<String> {
        let dir = self.upload_dir(upload_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(StorageError::not_found(format!("{key}?uploadId={upload_id}")));
        }
        tokio::fs::write(dir.join(format!("{part_number:05}")), &data)
            .await
            .map_err(|e| io_error(key, e))?;
        Ok(format!("\"{}\"", hex::encode(Sha256::digest(&data))))
    }

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> StorageResult<()> {
        let dir = self.upload_dir(upload_id);
        let owner = match tokio::fs::read_to_string(dir.join(UPLOAD_KEY_FILE)).await {
            Ok(owner) => owner,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!("{key}?uploadId={upload_id}")));
            }
            Err(e) => return Err(io_error(key, e)),
        };
        if owner != key {
            return Err(StorageError::permanent(key, "upload belongs to a different key"));
        }

        let mut contents = Vec::with_capacity(parts.len());
        for part in parts {
            let data = tokio::fs::read(dir.join(format!("{:05}", part.part_number)))
                .await
                .map_err(|e| StorageError::permanent(key, format!("part {}: {e}", part.part_number)))?;
            contents.push(data);
        }
        let slices: Vec<&[u8]> = contents.iter().map(Vec::as_slice).collect();

        let path = self.object_path(key)?;
        self.write_atomic(key, &path, &slices).await?;
        tokio::fs::remove_dir_all(&dir).await.map_err(|e| io_error(key, e))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        match tokio::fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}
