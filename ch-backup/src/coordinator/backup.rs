//! Backup coordinator.
//!
//! Freezes every selected table, stores each frozen part file as a
//! content-addressed chunk and writes the manifest as the very last step.
//! A run that fails or is cancelled before that point leaves no visible
//! backup, only chunks that later runs deduplicate against.
//!
//! A run first claims its name with a lock object, so concurrent runs never
//! share a name, a freeze name or a shadow directory.

use super::catalog::BackupCatalog;
use super::chunk::ChunkId;
use super::dedup::{Claim, DedupIndex};
use super::layout::{render_name, Layout};
use super::manifest::{BackupMeta, BackupState, DatabaseEntry, FileEntry, Manifest, PartEntry, TableEntry};
use crate::clickhouse::schema::{is_external_db_engine, is_merge_tree};
use crate::clickhouse::{ClickhouseControl, FrozenFile, FrozenPart, Table};
use crate::config::Config;
use crate::storage::StorageClient;
use crate::transfer::{format_bytes, format_speed, TransferStats};
use crate::utils::errors::{BackupError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_NAME_TEMPLATE: &str = "{timestamp}";

/// Suffixes tried for a generated name before giving up
const MAX_NAME_ATTEMPTS: usize = 100;

/// Semaphore permits a file takes out of a budget of `budget`.
/// Small files run fully parallel, the largest ones alone.
fn concurrency_weight(file_size: u64, budget: u32) -> u32 {
    let weight = match file_size {
        0..=10_485_759 => 1,                   // < 10 MB
        10_485_760..=104_857_599 => budget / 4, // 10 – 100 MB
        104_857_600..=1_073_741_823 => budget / 2, // 100 MB – 1 GB
        _ => budget, // > 1 GB
    };
    weight.clamp(1, budget.max(1))
}

/// What to back up
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Name template, `{timestamp}` when unset
    pub name: Option<String>,
    /// Restrict to these databases
    pub databases: Vec<String>,
    /// Restrict to these `db.table` names
    pub tables: Vec<String>,
    pub schema_only: bool,
    pub labels: BTreeMap<String, String>,
    /// Ignore `backup.min_interval`
    pub force: bool,
}

/// Table filter built from [`BackupOptions`]
struct Selection {
    databases: BTreeSet<String>,
    tables: BTreeSet<(String, String)>,
}

impl Selection {
    fn from_options(options: &BackupOptions) -> Result<Self> {
        let mut tables = BTreeSet::new();
        for spec in &options.tables {
            let (db, table) = spec
                .split_once('.')
                .filter(|(db, table)| !db.is_empty() && !table.is_empty())
                .ok_or_else(|| BackupError::Configuration(format!("table {spec:?} must be given as db.table")))?;
            tables.insert((db.to_string(), table.to_string()));
        }
        Ok(Self {
            databases: options.databases.iter().cloned().collect(),
            tables,
        })
    }

    fn is_empty(&self) -> bool {
        self.databases.is_empty() && self.tables.is_empty()
    }

    fn database(&self, db: &str) -> bool {
        self.is_empty() || self.databases.contains(db) || self.tables.iter().any(|(d, _)| d == db)
    }

    fn table(&self, db: &str, table: &str) -> bool {
        self.is_empty() || self.databases.contains(db) || self.tables.contains(&(db.to_string(), table.to_string()))
    }
}

/// Shared by the per-file upload tasks of one table
struct UploadContext {
    storage: Arc<StorageClient>,
    layout: Layout,
    dedup: Arc<DedupIndex>,
    stats: Arc<TransferStats>,
    validate: bool,
    slice_size: usize,
}

pub struct BackupCoordinator {
    config: Arc<Config>,
    storage: Arc<StorageClient>,
    clickhouse: Arc<dyn ClickhouseControl>,
    catalog: BackupCatalog,
    layout: Layout,
    cancel_token: CancellationToken,
}

impl BackupCoordinator {
    pub fn new(config: Arc<Config>, storage: Arc<StorageClient>, clickhouse: Arc<dyn ClickhouseControl>) -> Self {
        let layout = Layout::new(&config.backup.path_root);
        Self {
            catalog: BackupCatalog::new(Arc::clone(&storage), layout.clone()),
            config,
            storage,
            clickhouse,
            layout,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop before the manifest is written once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Run a backup and return its manifest. Unless forced, returns the last
    /// backup instead when it is younger than `backup.min_interval`.
    pub async fn create_backup(&self, options: BackupOptions) -> Result<Manifest> {
        if !options.force {
            if let Some(recent) = self.recent_backup().await? {
                info!(backup = recent.name(), "Skipping backup, the last one is younger than backup.min_interval");
                return Ok(recent);
            }
        }

        let start_time = Utc::now();
        let owner = uuid::Uuid::new_v4().to_string();
        let name = self.claim_name(&options, start_time, &owner).await?;

        info!(backup = %name, "Starting backup");
        let result = self.run(&name, start_time, &options).await;
        if let Err(e) = self.catalog.unlock(&name).await {
            warn!(backup = %name, error = %e, "Failed to release backup lock");
        }

        match result {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                error!(backup = %name, error = %e, "Backup failed");
                Err(BackupError::backup_failed(name, e))
            }
        }
    }

    async fn recent_backup(&self) -> Result<Option<Manifest>> {
        let Some(interval) = self.config.backup.min_interval()? else {
            return Ok(None);
        };
        let Some(last) = self.catalog.list_created().await?.into_iter().next() else {
            return Ok(None);
        };
        // A start time in the future counts as recent.
        let age = (Utc::now() - last.meta.start_time).to_std().unwrap_or_default();
        Ok((age < interval).then_some(last))
    }

    /// Render the name and lock it. Generated names take a numeric suffix
    /// while another run holds them; explicit names fail instead.
    async fn claim_name(&self, options: &BackupOptions, now: DateTime<Utc>, owner: &str) -> Result<String> {
        let generated = options.name.is_none();
        let base = render_name(options.name.as_deref().unwrap_or(DEFAULT_NAME_TEMPLATE), now)?;
        let attempts = if generated { MAX_NAME_ATTEMPTS } else { 1 };

        for attempt in 0..attempts {
            let name = if attempt == 0 { base.clone() } else { format!("{base}-{attempt}") };
            if self.catalog.lock(&name, owner).await? {
                // Finished runs write their manifest before releasing the lock.
                if !self.catalog.exists(&name).await? {
                    return Ok(name);
                }
                self.catalog.unlock(&name).await?;
            }
            debug!(backup = %name, "Backup name is taken");
        }

        Err(BackupError::Configuration(format!("backup {base} already exists")))
    }

    async fn run(&self, name: &str, start_time: chrono::DateTime<Utc>, options: &BackupOptions) -> Result<Manifest> {
        let selection = Selection::from_options(options)?;
        let ch_version = self.clickhouse.version().await?;

        let dedup = if self.config.backup.deduplicate_parts && !options.schema_only {
            DedupIndex::load(&self.storage, &self.layout).await?
        } else {
            DedupIndex::empty()
        };
        let ctx = Arc::new(UploadContext {
            storage: Arc::clone(&self.storage),
            layout: self.layout.clone(),
            dedup: Arc::new(dedup),
            stats: Arc::new(TransferStats::new()),
            validate: self.config.backup.validate_part_after_upload,
            slice_size: self.config.backup.max_chunk_size.max(1),
        });

        let mut labels = self.config.backup.labels.clone();
        labels.extend(options.labels.clone());

        let mut manifest = Manifest::new(BackupMeta {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ch_version,
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            start_time,
            end_time: None,
            bytes: 0,
            real_bytes: 0,
            state: BackupState::Creating,
            labels,
            schema_only: options.schema_only,
            encryption: self.storage.codec().encryption(),
            compression: self.storage.codec().compression(),
        });

        for database in self.clickhouse.list_databases().await? {
            if !selection.database(&database.name) {
                continue;
            }

            let mut db_entry = DatabaseEntry {
                engine: database.engine.clone(),
                create_statement: database.create_statement.clone(),
                tables: BTreeMap::new(),
            };

            if is_external_db_engine(&database.engine) {
                debug!(database = %database.name, engine = %database.engine, "Skipping tables of external database");
                manifest.databases.insert(database.name, db_entry);
                continue;
            }

            for table in self.clickhouse.list_tables(&database.name).await? {
                if !selection.table(&table.database, &table.name) {
                    continue;
                }
                if self.cancel_token.is_cancelled() {
                    return Err(BackupError::Cancelled);
                }

                let parts = if options.schema_only || !is_merge_tree(&table.engine) {
                    BTreeMap::new()
                } else {
                    match self.backup_table_data(name, &table, &ctx).await? {
                        Some(parts) => parts,
                        None => continue,
                    }
                };

                db_entry.tables.insert(
                    table.name.clone(),
                    TableEntry {
                        engine: table.engine,
                        uuid: table.uuid,
                        create_statement: table.create_statement,
                        parts,
                    },
                );
            }

            manifest.databases.insert(database.name, db_entry);
        }

        if self.cancel_token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let stats = ctx.stats.snapshot();
        manifest.meta.bytes = stats.bytes;
        manifest.meta.real_bytes = stats.uploaded_bytes;
        manifest.meta.end_time = Some(Utc::now());
        manifest.meta.state = BackupState::Created;
        self.catalog.save(&manifest).await?;

        info!(
            backup = %name,
            tables = manifest.tables().count(),
            parts = manifest.part_count(),
            uploaded_chunks = stats.uploaded_chunks,
            reused_chunks = stats.reused_chunks,
            "Backup created: {} logical, {} uploaded at {}",
            format_bytes(stats.bytes),
            format_bytes(stats.uploaded_bytes),
            format_speed(stats.bytes_per_second()),
        );
        Ok(manifest)
    }

    /// Freeze one table, store its parts and always drop the shadow copy.
    /// `None` when the table was dropped before it could be frozen.
    async fn backup_table_data(
        &self,
        backup_name: &str,
        table: &Table,
        ctx: &Arc<UploadContext>,
    ) -> Result<Option<BTreeMap<String, PartEntry>>> {
        let result = match self.clickhouse.freeze_table(backup_name, table).await {
            Ok(parts) => self.upload_parts(table, parts, ctx).await.map(Some),
            Err(e) => match self.table_dropped(table).await {
                Ok(true) => {
                    warn!(table = %table.full_name(), error = %e, "Table was dropped during backup, skipping it");
                    Ok(None)
                }
                Ok(false) => Err(e),
                Err(recheck) => {
                    debug!(table = %table.full_name(), error = %recheck, "Could not re-check table");
                    Err(e)
                }
            },
        };

        if let Err(e) = self.clickhouse.unfreeze(backup_name).await {
            warn!(table = %table.full_name(), error = %e, "Failed to remove frozen data");
        }
        result
    }

    async fn table_dropped(&self, table: &Table) -> Result<bool> {
        let tables = self.clickhouse.list_tables(&table.database).await?;
        Ok(!tables.iter().any(|t| t.name == table.name))
    }

    async fn upload_parts(
        &self,
        table: &Table,
        parts: Vec<FrozenPart>,
        ctx: &Arc<UploadContext>,
    ) -> Result<BTreeMap<String, PartEntry>> {
        let budget = u32::try_from(self.config.backup.max_concurrency).unwrap_or(u32::MAX).max(1);
        let semaphore = Arc::new(Semaphore::new(budget as usize));
        // Cancelled by the first failing task so the others stop early.
        let abort = self.cancel_token.child_token();

        let mut files: Vec<(usize, FrozenFile)> = parts
            .iter()
            .enumerate()
            .flat_map(|(idx, part)| part.files.iter().cloned().map(move |f| (idx, f)))
            .collect();
        files.sort_by_key(|(_, f)| f.size);

        info!(
            table = %table.full_name(),
            parts = parts.len(),
            files = files.len(),
            "Uploading table data"
        );

        let mut handles = Vec::with_capacity(files.len());
        for (idx, file) in files {
            let sem = Arc::clone(&semaphore);
            let ctx = Arc::clone(ctx);
            let cancel = abort.clone();

            handles.push(tokio::spawn(async move {
                let weight = concurrency_weight(file.size, budget);
                let _permit = tokio::select! {
                    permit = sem.acquire_many(weight) => permit.map_err(|_| BackupError::Cancelled)?,
                    _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                };

                let result = store_file(&ctx, &file).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result.map(|entry| (idx, entry))
            }));
        }

        let mut by_part: BTreeMap<usize, Vec<FileEntry>> = BTreeMap::new();
        let mut first_error: Option<BackupError> = None;
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| BackupError::Io(std::io::Error::other(format!("upload task failed: {e}"))))
                .and_then(|r| r);
            match outcome {
                Ok((idx, entry)) => by_part.entry(idx).or_default().push(entry),
                // A real failure explains more than the cancellations it triggered.
                Err(e) => match &first_error {
                    None | Some(BackupError::Cancelled) => first_error = Some(e),
                    Some(_) => {}
                },
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(idx, part)| {
                let files = by_part.remove(&idx).unwrap_or_default();
                (part.name, PartEntry::new(part.disk_name, files))
            })
            .collect())
    }
}

/// Store one part file as a sequence of slices, each one a chunk that is
/// reused when its content is already stored.
async fn store_file(ctx: &UploadContext, file: &FrozenFile) -> Result<FileEntry> {
    let mut reader = tokio::fs::File::open(&file.path).await?;
    let mut chunks = Vec::new();
    let mut size = 0u64;

    loop {
        let hint = usize::try_from(file.size.saturating_sub(size)).unwrap_or(usize::MAX);
        let mut slice = Vec::with_capacity(hint.min(ctx.slice_size));
        (&mut reader).take(ctx.slice_size as u64).read_to_end(&mut slice).await?;

        let last = slice.len() < ctx.slice_size;
        if slice.is_empty() && !chunks.is_empty() {
            break;
        }
        size += slice.len() as u64;
        chunks.push(store_slice(ctx, file, Bytes::from(slice)).await?);
        if last {
            break;
        }
    }

    Ok(FileEntry {
        name: file.name.clone(),
        size,
        chunks,
    })
}

async fn store_slice(ctx: &UploadContext, file: &FrozenFile, data: Bytes) -> Result<ChunkId> {
    let size = data.len() as u64;
    let id = hash_chunk(data.clone()).await?;

    match ctx.dedup.claim(&id).await {
        Claim::Known | Claim::InFlight => {
            debug!(file = %file.path.display(), chunk = %id, "Reusing stored chunk");
            ctx.stats.record_reuse(size);
        }
        Claim::Upload => match upload_chunk(ctx, &id, data).await {
            Ok(stored) => {
                ctx.dedup.complete(&id).await;
                ctx.stats.record_upload(size, stored);
                debug!(file = %file.path.display(), chunk = %id, size, stored, "Uploaded chunk");
            }
            Err(e) => {
                ctx.dedup.release(&id).await;
                return Err(e);
            }
        },
    }
    Ok(id)
}

async fn upload_chunk(ctx: &UploadContext, id: &ChunkId, data: Bytes) -> Result<u64> {
    let key = ctx.layout.chunk_key(id);
    let stored = ctx.storage.put_encoded(&key, data).await?;

    if ctx.validate {
        let actual = match ctx.storage.get_decoded(&key).await {
            Ok(read_back) => hash_chunk(Bytes::from(read_back)).await?.to_string(),
            Err(BackupError::Codec(reason)) => format!("undecodable chunk ({reason})"),
            Err(e) => return Err(e),
        };
        if actual != id.as_str() {
            return Err(BackupError::Validation {
                key,
                expected: id.to_string(),
                actual,
            });
        }
    }
    Ok(stored)
}

async fn hash_chunk(data: Bytes) -> Result<ChunkId> {
    tokio::task::spawn_blocking(move || ChunkId::of(&data))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(format!("hash task failed: {e}"))))
}
