//! Restore coordinator.
//!
//! Restores a created backup into a ClickHouse node: schema first, in
//! dependency order, then the data parts of every selected table, whether
//! this run created it or found it already in place. Parts the destination
//! already has active are left alone, so a failed restore can be rerun. All
//! chunks a restore needs are checked before the destination is touched.

use super::catalog::{BackupCatalog, BackupSelector};
use super::chunk::ChunkId;
use super::layout::Layout;
use super::manifest::{FileEntry, Manifest, PartEntry, TableEntry};
use crate::clickhouse::schema::{compare_schema, is_merge_tree, is_replicated, override_replica_name, restore_priority};
use crate::clickhouse::{ClickhouseControl, DatabaseInfo, Table};
use crate::config::{BackupConfig, Config};
use crate::storage::StorageClient;
use crate::transfer::{format_bytes, format_speed, TransferSnapshot, TransferStats};
use crate::utils::errors::{BackupError, Result, StorageError};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happens to replica names of replicated tables
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplicaNameStrategy {
    /// Use create statements as recorded
    #[default]
    Keep,
    /// Substitute this replica name into `Replicated*MergeTree` engines
    Override(String),
}

impl ReplicaNameStrategy {
    pub fn from_config(config: &BackupConfig) -> Self {
        match config.override_replica_name.as_deref() {
            Some(name) if !name.is_empty() => Self::Override(name.to_string()),
            _ => Self::Keep,
        }
    }

    pub fn apply(&self, engine: &str, create_statement: &str) -> String {
        match self {
            Self::Override(replica) if is_replicated(engine) => override_replica_name(create_statement, replica),
            _ => create_statement.to_string(),
        }
    }
}

/// What happens when the destination refuses a restored part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachFailurePolicy {
    /// Abort the restore
    Fail,
    /// Log, record in the report and continue
    #[default]
    Skip,
}

impl AttachFailurePolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        if config.restore_fail_on_attach_error {
            Self::Fail
        } else {
            Self::Skip
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreTarget {
    pub backup: BackupSelector,
    /// Restore only these databases; all when empty
    pub databases: Vec<String>,
    pub exclude_databases: Vec<String>,
    pub schema_only: bool,
}

impl RestoreTarget {
    pub fn new(backup: BackupSelector) -> Self {
        Self {
            backup,
            databases: Vec::new(),
            exclude_databases: Vec::new(),
            schema_only: false,
        }
    }

    fn includes(&self, database: &str) -> bool {
        (self.databases.is_empty() || self.databases.iter().any(|d| d == database))
            && !self.exclude_databases.iter().any(|d| d == database)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPart {
    pub table: String,
    pub part: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup: String,
    pub databases_created: Vec<String>,
    pub tables_created: Vec<String>,
    /// Existing tables whose schema matched and were left untouched
    pub tables_reused: Vec<String>,
    pub parts_attached: usize,
    /// Parts the destination already had active
    pub parts_present: usize,
    pub parts_skipped: Vec<SkippedPart>,
    pub transfer: TransferSnapshot,
}

/// A table queued for creation or data restore
struct PendingTable<'a> {
    table: Table,
    entry: &'a TableEntry,
}

pub struct RestoreCoordinator {
    config: Arc<Config>,
    storage: Arc<StorageClient>,
    clickhouse: Arc<dyn ClickhouseControl>,
    catalog: BackupCatalog,
    layout: Layout,
    replica: ReplicaNameStrategy,
    attach_policy: AttachFailurePolicy,
    cancel_token: CancellationToken,
}

impl RestoreCoordinator {
    pub fn new(config: Arc<Config>, storage: Arc<StorageClient>, clickhouse: Arc<dyn ClickhouseControl>) -> Self {
        let layout = Layout::new(&config.backup.path_root);
        Self {
            catalog: BackupCatalog::new(Arc::clone(&storage), layout.clone()),
            replica: ReplicaNameStrategy::from_config(&config.backup),
            attach_policy: AttachFailurePolicy::from_config(&config.backup),
            config,
            storage,
            clickhouse,
            layout,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_replica_strategy(mut self, strategy: ReplicaNameStrategy) -> Self {
        self.replica = strategy;
        self
    }

    pub fn with_attach_policy(mut self, policy: AttachFailurePolicy) -> Self {
        self.attach_policy = policy;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub async fn restore_backup(&self, target: &RestoreTarget) -> Result<RestoreReport> {
        let manifest = self.catalog.resolve(&target.backup).await?;
        let name = manifest.name().to_string();

        info!(backup = %name, "Starting restore");
        self.run(&manifest, target)
            .await
            .map_err(|e| BackupError::restore_failed(&name, e))
    }

    async fn run(&self, manifest: &Manifest, target: &RestoreTarget) -> Result<RestoreReport> {
        let schema_only = target.schema_only || manifest.meta.schema_only;
        let selected: Vec<(&str, &str, &TableEntry)> = manifest.tables().filter(|(db, _, _)| target.includes(db)).collect();

        if !schema_only {
            self.ensure_chunks_present(&selected).await?;
        }

        let mut report = RestoreReport {
            backup: manifest.name().to_string(),
            databases_created: Vec::new(),
            tables_created: Vec::new(),
            tables_reused: Vec::new(),
            parts_attached: 0,
            parts_present: 0,
            parts_skipped: Vec::new(),
            transfer: TransferStats::new().snapshot(),
        };

        let existing_dbs: HashSet<String> = self
            .clickhouse
            .list_databases()
            .await?
            .into_iter()
            .map(|db| db.name)
            .collect();
        for (db_name, db) in manifest.databases.iter().filter(|(db, _)| target.includes(db)) {
            if existing_dbs.contains(db_name) {
                continue;
            }
            self.clickhouse
                .create_database(&DatabaseInfo {
                    name: db_name.clone(),
                    engine: db.engine.clone(),
                    create_statement: db.create_statement.clone(),
                })
                .await?;
            info!(database = %db_name, "Created database");
            report.databases_created.push(db_name.clone());
        }

        let mut pending = Vec::new();
        let mut reused = Vec::new();
        let mut existing_tables: HashMap<String, HashMap<String, Table>> = HashMap::new();
        for &(db, name, entry) in &selected {
            if !existing_tables.contains_key(db) {
                let tables = self.clickhouse.list_tables(db).await?;
                existing_tables.insert(db.to_string(), tables.into_iter().map(|t| (t.name.clone(), t)).collect());
            }

            let table = Table {
                database: db.to_string(),
                name: name.to_string(),
                engine: entry.engine.clone(),
                uuid: entry.uuid.clone(),
                create_statement: self.replica.apply(&entry.engine, &entry.create_statement),
                data_paths: Vec::new(),
            };

            match existing_tables.get(db).and_then(|tables| tables.get(name)) {
                Some(current) if compare_schema(&current.create_statement, &table.create_statement) => {
                    debug!(table = %table.full_name(), "Table exists with the same schema, keeping it");
                    report.tables_reused.push(table.full_name());
                    reused.push(PendingTable {
                        table: current.clone(),
                        entry,
                    });
                    continue;
                }
                Some(_) => {
                    warn!(table = %table.full_name(), "Table exists with a different schema, recreating it");
                    self.clickhouse.drop_table(db, name).await?;
                }
                None => {}
            }
            pending.push(PendingTable { table, entry });
        }

        let created = self.create_tables(pending).await?;
        report.tables_created = created.iter().map(|p| p.table.full_name()).collect();

        if !schema_only {
            let stats = Arc::new(TransferStats::new());
            for pending in reused.iter().chain(&created) {
                if self.cancel_token.is_cancelled() {
                    return Err(BackupError::Cancelled);
                }
                if pending.entry.parts.is_empty() || !is_merge_tree(&pending.entry.engine) {
                    continue;
                }
                self.restore_table_data(pending, &stats, &mut report).await?;
            }
            report.transfer = stats.snapshot();
        }

        info!(
            backup = %report.backup,
            tables_created = report.tables_created.len(),
            tables_reused = report.tables_reused.len(),
            parts_attached = report.parts_attached,
            parts_present = report.parts_present,
            parts_skipped = report.parts_skipped.len(),
            "Restore finished, {} downloaded at {}",
            format_bytes(report.transfer.downloaded_bytes),
            format_speed(report.transfer.bytes_per_second()),
        );
        Ok(report)
    }

    /// Fail before touching the destination if any chunk is gone.
    async fn ensure_chunks_present(&self, tables: &[(&str, &str, &TableEntry)]) -> Result<()> {
        let needed: BTreeSet<&ChunkId> = tables
            .iter()
            .flat_map(|(_, _, t)| t.parts.values())
            .flat_map(|p| p.files.iter().flat_map(|f| f.chunks.iter()))
            .collect();
        if needed.is_empty() {
            return Ok(());
        }

        let stored: HashSet<ChunkId> = self
            .storage
            .list(&self.layout.chunks_prefix())
            .await?
            .iter()
            .filter_map(|obj| self.layout.chunk_id(&obj.key))
            .collect();

        let missing: Vec<String> = needed
            .into_iter()
            .filter(|id| !stored.contains(*id))
            .map(|id| self.layout.chunk_key(id))
            .collect();
        if let Some(first) = missing.first() {
            return Err(BackupError::Storage(StorageError::permanent(
                first.clone(),
                format!("{} chunk(s) referenced by the backup are missing", missing.len()),
            )));
        }
        Ok(())
    }

    /// Create tables in restore-priority order. Tables that fail are retried
    /// after the rest until a round makes no progress.
    async fn create_tables<'a>(&self, mut pending: Vec<PendingTable<'a>>) -> Result<Vec<PendingTable<'a>>> {
        pending.sort_by_key(|p| restore_priority(&p.table.engine));

        let mut created = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let round = pending.len();
            let mut failed = Vec::new();
            let mut last_error = String::new();

            for mut item in pending {
                match self.clickhouse.create_table(&item.table).await {
                    Ok(()) => {
                        item.table.data_paths = self.data_paths(&item.table).await?;
                        info!(table = %item.table.full_name(), "Created table");
                        created.push(item);
                    }
                    Err(e) => {
                        debug!(table = %item.table.full_name(), error = %e, "Table creation failed, will retry");
                        last_error = format!("{}: {e}", item.table.full_name());
                        failed.push(item);
                    }
                }
            }

            if failed.len() == round {
                return Err(BackupError::Clickhouse(format!(
                    "could not create {} table(s), last error: {last_error}",
                    failed.len()
                )));
            }
            pending = failed;
        }
        Ok(created)
    }

    /// Data directories the server assigned to a freshly created table
    async fn data_paths(&self, table: &Table) -> Result<Vec<PathBuf>> {
        Ok(self
            .clickhouse
            .list_tables(&table.database)
            .await?
            .into_iter()
            .find(|t| t.name == table.name)
            .map(|t| t.data_paths)
            .unwrap_or_default())
    }

    async fn restore_table_data(
        &self,
        pending: &PendingTable<'_>,
        stats: &Arc<TransferStats>,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let table = &pending.table;
        let active: HashSet<String> = self.clickhouse.list_parts(table).await?.into_iter().collect();
        let to_restore: Vec<(&String, &PartEntry)> = pending
            .entry
            .parts
            .iter()
            .filter(|(name, _)| !active.contains(*name))
            .collect();
        let present = pending.entry.parts.len() - to_restore.len();
        if present > 0 {
            debug!(table = %table.full_name(), parts = present, "Parts already attached, leaving them");
            report.parts_present += present;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.backup.max_concurrency.max(1)));
        let abort = self.cancel_token.child_token();

        let mut handles = Vec::new();
        for &(part_name, part) in &to_restore {
            let dir = self.clickhouse.detached_part_dir(table, part_name, &part.disk_name).await?;
            for file in &part.files {
                let sem = Arc::clone(&semaphore);
                let storage = Arc::clone(&self.storage);
                let layout = self.layout.clone();
                let file = file.clone();
                let dest = dir.clone();
                let stats = Arc::clone(stats);
                let cancel = abort.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = tokio::select! {
                        permit = sem.acquire_owned() => permit.map_err(|_| BackupError::Cancelled)?,
                        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                    };
                    let result = fetch_file(&storage, &layout, &file, &dest).await;
                    match &result {
                        Ok(()) => stats.record_download(file.size),
                        Err(_) => cancel.cancel(),
                    }
                    result
                }));
            }
        }

        let mut first_error: Option<BackupError> = None;
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| BackupError::Io(std::io::Error::other(format!("download task failed: {e}"))))
                .and_then(|r| r);
            if let Err(e) = outcome {
                if matches!(first_error, None | Some(BackupError::Cancelled)) {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        for (part_name, part) in to_restore {
            match self.clickhouse.attach_part(table, part_name, &part.disk_name).await {
                Ok(()) => {
                    debug!(table = %table.full_name(), part = %part_name, "Attached part");
                    report.parts_attached += 1;
                }
                Err(e) => {
                    let reason = e.to_string();
                    match self.attach_policy {
                        AttachFailurePolicy::Fail => {
                            return Err(BackupError::Attach {
                                table: table.full_name(),
                                part: part_name.clone(),
                                reason,
                            })
                        }
                        AttachFailurePolicy::Skip => {
                            warn!(table = %table.full_name(), part = %part_name, error = %reason, "Skipping part that failed to attach");
                            report.parts_skipped.push(SkippedPart {
                                table: table.full_name(),
                                part: part_name.clone(),
                                reason,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Download the chunks of one part file in order, check each and write
/// the file out.
async fn fetch_file(storage: &StorageClient, layout: &Layout, file: &FileEntry, part_dir: &Path) -> Result<()> {
    let dest = part_dir.join(&file.name);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut out = tokio::fs::File::create(&dest).await?;
    for id in &file.chunks {
        let data = fetch_chunk(storage, &layout.chunk_key(id), id).await?;
        out.write_all(&data).await?;
    }
    out.flush().await?;
    Ok(())
}

async fn fetch_chunk(storage: &StorageClient, key: &str, expected: &ChunkId) -> Result<Vec<u8>> {
    let data = storage.get_decoded(key).await?;
    let (data, actual) = tokio::task::spawn_blocking(move || {
        let id = ChunkId::of(&data);
        (data, id)
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(format!("hash task failed: {e}"))))?;

    if &actual != expected {
        return Err(BackupError::Validation {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(data)
}
