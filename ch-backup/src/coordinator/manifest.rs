//! Backup manifest, stored as `backup_struct.json`.
//!
//! A manifest records one backup: its metadata and, per database and table,
//! the parts and the chunks every part file was stored as.

use super::chunk::ChunkId;
use crate::config::{CompressionType, EncryptionType};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Created,
    Creating,
    Deleting,
    PartiallyDeleted,
    Failed,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::Created => "created",
            BackupState::Creating => "creating",
            BackupState::Deleting => "deleting",
            BackupState::PartiallyDeleted => "partially_deleted",
            BackupState::Failed => "failed",
        }
    }

    /// Whether chunks referenced by a backup in this state must be kept
    pub fn protects_chunks(&self) -> bool {
        !matches!(self, BackupState::Deleting | BackupState::PartiallyDeleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub name: String,
    /// Tool version that wrote the backup
    pub version: String,
    pub ch_version: String,
    pub hostname: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Logical size of all backed up part files
    pub bytes: u64,
    /// Bytes actually uploaded by this backup
    pub real_bytes: u64,
    pub state: BackupState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub schema_only: bool,
    pub encryption: EncryptionType,
    pub compression: CompressionType,
}

/// One part file. Files larger than the slice size are stored as several
/// chunks whose contents concatenate, in order, to the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub chunks: Vec<ChunkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    pub checksum: String,
    pub bytes: u64,
    pub disk_name: String,
    pub files: Vec<FileEntry>,
}

impl PartEntry {
    pub fn new(disk_name: impl Into<String>, mut files: Vec<FileEntry>) -> Self {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        let bytes = files.iter().map(|f| f.size).sum();
        Self {
            checksum: part_checksum(&files),
            bytes,
            disk_name: disk_name.into(),
            files,
        }
    }
}

/// Digest over the (name, chunks) pairs of a part, independent of file order.
fn part_checksum(files: &[FileEntry]) -> String {
    let mut sorted: Vec<&FileEntry> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.name.as_bytes());
        hasher.update([0]);
        for chunk in &file.chunks {
            hasher.update(chunk.as_str().as_bytes());
            hasher.update([b',']);
        }
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub engine: String,
    pub uuid: Option<String>,
    pub create_statement: String,
    #[serde(default)]
    pub parts: BTreeMap<String, PartEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub engine: String,
    pub create_statement: String,
    #[serde(default)]
    pub tables: BTreeMap<String, TableEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub meta: BackupMeta,
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseEntry>,
}

impl Manifest {
    pub fn new(meta: BackupMeta) -> Self {
        Self {
            meta,
            databases: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn is_restorable(&self) -> bool {
        self.meta.state == BackupState::Created
    }

    /// Every chunk the backup needs, deduplicated
    pub fn chunk_ids(&self) -> BTreeSet<ChunkId> {
        self.tables()
            .flat_map(|(_, _, table)| table.parts.values())
            .flat_map(|part| part.files.iter().flat_map(|f| f.chunks.iter().cloned()))
            .collect()
    }

    /// `(database, table, entry)` in name order
    pub fn tables(&self) -> impl Iterator<Item = (&str, &str, &TableEntry)> {
        self.databases.iter().flat_map(|(db, entry)| {
            entry
                .tables
                .iter()
                .map(move |(name, table)| (db.as_str(), name.as_str(), table))
        })
    }

    pub fn part_count(&self) -> usize {
        self.tables().map(|(_, _, t)| t.parts.len()).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
