//! Backup deletion, retention purge and chunk garbage collection.
//!
//! Chunks are shared between backups, so removing a backup never deletes
//! chunks directly. The manifest is first marked `deleting`, which stops it
//! from protecting its chunks, then a sweep removes every chunk no remaining
//! manifest references. Chunks younger than the grace period survive the
//! sweep because a running backup may have uploaded them without having
//! written its manifest yet.
//!
//! Nothing is marked or deleted unless every manifest in storage can be read:
//! a chunk referenced only by an unreadable manifest is still referenced.

use super::catalog::BackupCatalog;
use super::chunk::ChunkId;
use super::layout::Layout;
use super::manifest::{BackupState, Manifest};
use crate::config::Config;
use crate::storage::StorageClient;
use crate::utils::errors::{BackupError, Result, StorageError};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub deleted_chunks: usize,
    pub freed_bytes: u64,
    pub failed_chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub deleted_backups: Vec<String>,
    pub sweep: SweepReport,
}

/// Which backups a purge keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    pub retain_count: Option<usize>,
    pub retain_time: Option<Duration>,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            retain_count: config.backup.retain_count,
            retain_time: config.backup.retain_time()?,
        })
    }

    /// Names of created backups to delete. `backups` is newest first.
    /// A backup goes only when every configured limit lets it go.
    pub fn expired<'a>(&self, backups: &'a [Manifest], now: DateTime<Utc>) -> Vec<&'a str> {
        if self.retain_count.is_none() && self.retain_time.is_none() {
            return Vec::new();
        }

        backups
            .iter()
            .filter(|m| m.is_restorable())
            .enumerate()
            .filter(|(index, manifest)| {
                let beyond_count = self.retain_count.map_or(true, |count| *index >= count);
                let too_old = self.retain_time.map_or(true, |max_age| {
                    (now - manifest.meta.start_time)
                        .to_std()
                        .map_or(false, |age| age > max_age)
                });
                beyond_count && too_old
            })
            .map(|(_, m)| m.name())
            .collect()
    }
}

/// Backups a purge removes whatever the retention policy says
fn is_leftover(state: BackupState, purge_partial: bool) -> bool {
    match state {
        BackupState::Deleting => true,
        BackupState::Failed | BackupState::PartiallyDeleted => purge_partial,
        BackupState::Created | BackupState::Creating => false,
    }
}

pub struct RetentionManager {
    storage: Arc<StorageClient>,
    catalog: BackupCatalog,
    layout: Layout,
    policy: RetentionPolicy,
    grace_period: Duration,
    concurrency: usize,
}

impl RetentionManager {
    pub fn new(config: Arc<Config>, storage: Arc<StorageClient>) -> Result<Self> {
        let layout = Layout::new(&config.backup.path_root);
        Ok(Self {
            catalog: BackupCatalog::new(Arc::clone(&storage), layout.clone()),
            policy: RetentionPolicy::from_config(&config)?,
            grace_period: config.backup.gc_grace_period()?,
            concurrency: config.backup.max_concurrency.max(1),
            storage,
            layout,
        })
    }

    /// Delete one backup and the chunks only it referenced.
    pub async fn delete_backup(&self, name: &str) -> Result<SweepReport> {
        self.catalog.list_strict().await?;
        let mut manifest = self.catalog.load(name).await?;
        self.catalog.set_state(&mut manifest, BackupState::Deleting).await?;
        info!(backup = name, "Deleting backup");

        let sweep = self.sweep().await?;
        if sweep.failed_chunks > 0 {
            self.catalog
                .set_state(&mut manifest, BackupState::PartiallyDeleted)
                .await?;
            return Err(BackupError::Storage(StorageError::permanent(
                self.layout.manifest_key(name),
                format!("{} chunk(s) could not be deleted, backup left partially deleted", sweep.failed_chunks),
            )));
        }

        self.catalog.remove(name).await?;
        info!(backup = name, deleted_chunks = sweep.deleted_chunks, "Backup deleted");
        Ok(sweep)
    }

    /// Like [`delete_backup`](Self::delete_backup), but a missing backup is
    /// not an error. `None` when there was nothing to delete.
    pub async fn delete_if_exists(&self, name: &str) -> Result<Option<SweepReport>> {
        match self.delete_backup(name).await {
            Ok(sweep) => Ok(Some(sweep)),
            Err(BackupError::BackupNotFound(_)) => {
                info!(backup = name, "Backup does not exist, nothing to delete");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete backups outside the retention policy, plus leftovers of
    /// deletions that did not finish. With `purge_partial`, failed and
    /// partially deleted backups go too.
    pub async fn purge(&self, purge_partial: bool) -> Result<PurgeReport> {
        let all = self.catalog.list_strict().await?;
        let mut doomed: Vec<String> = self
            .policy
            .expired(&all, Utc::now())
            .into_iter()
            .map(str::to_string)
            .collect();
        doomed.extend(
            all.iter()
                .filter(|m| is_leftover(m.meta.state, purge_partial))
                .map(|m| m.name().to_string()),
        );

        if doomed.is_empty() {
            info!("No backups to purge, collecting garbage only");
            return Ok(PurgeReport {
                deleted_backups: Vec::new(),
                sweep: self.collect_garbage().await?,
            });
        }

        for mut manifest in all.into_iter().filter(|m| doomed.iter().any(|d| d == m.name())) {
            if manifest.meta.state != BackupState::Deleting {
                self.catalog.set_state(&mut manifest, BackupState::Deleting).await?;
            }
        }

        let sweep = self.sweep().await?;
        if sweep.failed_chunks > 0 {
            for name in &doomed {
                let mut manifest = self.catalog.load(name).await?;
                self.catalog
                    .set_state(&mut manifest, BackupState::PartiallyDeleted)
                    .await?;
            }
            return Err(BackupError::Storage(StorageError::permanent(
                self.layout.chunks_prefix(),
                format!("{} chunk(s) could not be deleted during purge", sweep.failed_chunks),
            )));
        }

        for name in &doomed {
            self.catalog.remove(name).await?;
        }
        info!(backups = doomed.len(), deleted_chunks = sweep.deleted_chunks, "Purge finished");

        Ok(PurgeReport {
            deleted_backups: doomed,
            sweep,
        })
    }

    /// Remove chunks no manifest protects.
    pub async fn collect_garbage(&self) -> Result<SweepReport> {
        self.sweep().await
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let protected: HashSet<ChunkId> = self
            .catalog
            .list_strict()
            .await?
            .iter()
            .filter(|m| m.meta.state.protects_chunks())
            .flat_map(Manifest::chunk_ids)
            .collect();

        let grace = chrono::Duration::from_std(self.grace_period)
            .map_err(|e| BackupError::Configuration(format!("backup.gc_grace_period: {e}")))?;
        let cutoff = Utc::now() - grace;

        let orphans: Vec<(String, u64)> = self
            .storage
            .list(&self.layout.chunks_prefix())
            .await?
            .into_iter()
            .filter(|obj| obj.last_modified <= cutoff)
            .filter(|obj| {
                self.layout
                    .chunk_id(&obj.key)
                    .is_some_and(|id| !protected.contains(&id))
            })
            .map(|obj| (obj.key, obj.size))
            .collect();

        let storage = &self.storage;
        let results: Vec<(String, u64, Result<()>)> = stream::iter(orphans)
            .map(|(key, size)| async move {
                let result = storage.delete(&key).await;
                (key, size, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (key, size, result) in results {
            match result {
                Ok(()) => {
                    report.deleted_chunks += 1;
                    report.freed_bytes += size;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete chunk");
                    report.failed_chunks += 1;
                }
            }
        }

        info!(
            protected = protected.len(),
            deleted = report.deleted_chunks,
            failed = report.failed_chunks,
            "Garbage collection finished"
        );
        Ok(report)
    }
}
