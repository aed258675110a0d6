//! ClickHouse access used by the coordinators.
//!
//! [`ClickhouseControl`] is the seam between the backup logic and a server:
//! [`control::ClickhouseCtl`] drives a real server over its HTTP interface and
//! the local data directory, tests substitute directory-backed fakes.

pub mod client;
pub mod control;
pub mod schema;

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use control::ClickhouseCtl;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub engine: String,
    pub create_statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub database: String,
    pub name: String,
    pub engine: String,
    pub uuid: Option<String>,
    pub create_statement: String,
    /// Absolute data directories, one per disk
    pub data_paths: Vec<PathBuf>,
}

impl Table {
    /// `db.table` for logs and error messages
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

/// A file inside a frozen part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenFile {
    /// Path relative to the part directory, `/`-separated
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A data part captured by `FREEZE`, still sitting in the shadow directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenPart {
    pub database: String,
    pub table: String,
    pub name: String,
    pub disk_name: String,
    pub path: PathBuf,
    pub files: Vec<FrozenFile>,
}

impl FrozenPart {
    pub fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[async_trait]
pub trait ClickhouseControl: Send + Sync {
    async fn version(&self) -> Result<String>;

    /// User databases, system ones excluded
    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>>;

    async fn list_tables(&self, database: &str) -> Result<Vec<Table>>;

    /// Freeze `table` under `backup_name` and describe the resulting parts.
    async fn freeze_table(&self, backup_name: &str, table: &Table) -> Result<Vec<FrozenPart>>;

    /// Remove everything frozen under `backup_name`.
    async fn unfreeze(&self, backup_name: &str) -> Result<()>;

    async fn create_database(&self, database: &DatabaseInfo) -> Result<()>;

    async fn create_table(&self, table: &Table) -> Result<()>;

    async fn drop_table(&self, database: &str, name: &str) -> Result<()>;

    /// Names of the parts `table` currently has active
    async fn list_parts(&self, table: &Table) -> Result<Vec<String>>;

    /// Directory a downloaded part must be written to before attaching,
    /// on the disk named `disk_name` when the table has a path there
    async fn detached_part_dir(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<PathBuf>;

    async fn attach_part(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<()>;
}
