//! Control of a live ClickHouse server: metadata over HTTP, part files
//! through the local data directories of its disks.
//!
//! A table keeps one data path per disk it stores parts on. `FREEZE` puts
//! the hard links of each disk under that disk's own `shadow/` directory,
//! and restored parts go back to the `detached/` directory on the disk they
//! were taken from.

use super::client::ClickhouseClient;
use super::schema::{quote_ident, quote_str};
use super::{ClickhouseControl, DatabaseInfo, FrozenFile, FrozenPart, Table};
use crate::config::ClickhouseConfig;
use crate::fs::walker::{list_subdirs, walk_files, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Deserialize)]
struct VersionRow {
    version: String,
}

#[derive(Debug, Deserialize)]
struct DatabaseRow {
    name: String,
    engine: String,
}

#[derive(Debug, Deserialize)]
struct StatementRow {
    statement: String,
}

#[derive(Debug, Deserialize)]
struct PartRow {
    name: String,
}

/// A row of `system.disks`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Disk {
    name: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    database: String,
    name: String,
    engine: String,
    uuid: String,
    create_table_query: String,
    data_paths: Vec<String>,
}

impl From<TableRow> for Table {
    fn from(row: TableRow) -> Self {
        Table {
            database: row.database,
            name: row.name,
            engine: row.engine,
            uuid: Some(row.uuid).filter(|u| u != NIL_UUID && !u.is_empty()),
            create_statement: row.create_table_query,
            data_paths: row.data_paths.into_iter().map(PathBuf::from).collect(),
        }
    }
}

pub struct ClickhouseCtl {
    client: ClickhouseClient,
    data_path: PathBuf,
    owner: String,
    group: String,
}

impl ClickhouseCtl {
    pub fn new(config: &ClickhouseConfig) -> Result<Self> {
        Ok(Self {
            client: ClickhouseClient::new(config)?,
            data_path: config.resolve_data_path(),
            owner: config.user_owner.clone(),
            group: config.group_owner.clone(),
        })
    }

    /// Disks of the server; just the data path when none are reported.
    async fn disks(&self) -> Result<Vec<Disk>> {
        let disks: Vec<Disk> = self
            .client
            .query("SELECT name, path FROM system.disks ORDER BY name", &[])
            .await?;
        if disks.is_empty() {
            return Ok(vec![Disk {
                name: "default".to_string(),
                path: self.data_path.clone(),
            }]);
        }
        Ok(disks)
    }

    /// Detached directory of `part_name` on the disk the part came from,
    /// falling back to the table's first data path for unknown disks.
    async fn detached_dir(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<PathBuf> {
        let disks = self.disks().await?;
        let data_path = data_path_on_disk(&table.data_paths, &disks, disk_name)
            .or_else(|| table.data_paths.first().map(PathBuf::as_path))
            .ok_or_else(|| BackupError::Clickhouse(format!("table {} has no data path", table.full_name())))?;
        Ok(data_path.join("detached").join(part_name))
    }
}

/// The disk holding `data_path`, the most specific one when disk paths nest.
fn disk_for_path<'a>(disks: &'a [Disk], data_path: &Path) -> Option<&'a Disk> {
    disks
        .iter()
        .filter(|d| data_path.starts_with(&d.path))
        .max_by_key(|d| d.path.components().count())
}

/// Shadow copy of one table data path: `<disk>/shadow/<backup>/<relative>`.
fn frozen_table_dir<'a>(disks: &'a [Disk], backup_name: &str, data_path: &Path) -> Result<(&'a Disk, PathBuf)> {
    let disk = disk_for_path(disks, data_path).ok_or_else(|| {
        BackupError::Clickhouse(format!("table data path {} is not on any disk", data_path.display()))
    })?;
    let relative = data_path.strip_prefix(&disk.path).map_err(|_| {
        BackupError::Clickhouse(format!("{} is outside {}", data_path.display(), disk.path.display()))
    })?;
    Ok((disk, disk.path.join("shadow").join(backup_name).join(relative)))
}

fn data_path_on_disk<'a>(data_paths: &'a [PathBuf], disks: &[Disk], disk_name: &str) -> Option<&'a Path> {
    let disk = disks.iter().find(|d| d.name == disk_name)?;
    data_paths
        .iter()
        .find(|p| disk_for_path(disks, p).is_some_and(|d| d.name == disk.name))
        .map(PathBuf::as_path)
}

/// Enumerate frozen parts and their files below `dir`.
fn scan_frozen_parts(dir: &Path, database: &str, table: &str, disk_name: &str) -> std::io::Result<Vec<FrozenPart>> {
    let mut parts = Vec::new();
    for part_dir in list_subdirs(dir)? {
        let name = match part_dir.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let files = walk_files(&part_dir, &WalkOptions::default())?
            .into_iter()
            .map(|f| FrozenFile {
                name: f.relative_key(),
                size: f.size,
                path: f.path,
            })
            .collect();

        parts.push(FrozenPart {
            database: database.to_string(),
            table: table.to_string(),
            name,
            disk_name: disk_name.to_string(),
            path: part_dir,
            files,
        });
    }
    Ok(parts)
}

/// Hand restored files to the server's user so it can take ownership on attach.
fn chown_tree(root: &Path, owner: &str, group: &str) -> std::result::Result<(), String> {
    use nix::unistd::{chown, Group, User};

    let uid = User::from_name(owner)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("unknown user {owner}"))?
        .uid;
    let gid = Group::from_name(group)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("unknown group {group}"))?
        .gid;

    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| e.to_string())?;
        chown(entry.path(), Some(uid), Some(gid)).map_err(|e| format!("{}: {e}", entry.path().display()))?;
    }
    Ok(())
}

#[async_trait]
impl ClickhouseControl for ClickhouseCtl {
    async fn version(&self) -> Result<String> {
        let rows: Vec<VersionRow> = self.client.query("SELECT version() AS version", &[]).await?;
        rows.into_iter()
            .next()
            .map(|r| r.version)
            .ok_or_else(|| BackupError::Clickhouse("version() returned no rows".to_string()))
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let rows: Vec<DatabaseRow> = self
            .client
            .query(
                "SELECT name, engine FROM system.databases \
                 WHERE name NOT IN ('system', 'information_schema', 'INFORMATION_SCHEMA', '_temporary_and_external_tables') \
                 ORDER BY name",
                &[],
            )
            .await?;

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            let statement: Vec<StatementRow> = self
                .client
                .query(&format!("SHOW CREATE DATABASE {}", quote_ident(&row.name)), &[])
                .await?;
            let create_statement = statement
                .into_iter()
                .next()
                .map(|s| s.statement)
                .unwrap_or_else(|| format!("CREATE DATABASE {}", quote_ident(&row.name)));

            databases.push(DatabaseInfo {
                name: row.name,
                engine: row.engine,
                create_statement,
            });
        }
        Ok(databases)
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<Table>> {
        let rows: Vec<TableRow> = self
            .client
            .query(
                "SELECT database, name, engine, toString(uuid) AS uuid, create_table_query, data_paths \
                 FROM system.tables \
                 WHERE database = {db:String} AND NOT is_temporary AND NOT startsWith(name, '.inner') \
                 ORDER BY name",
                &[("db", database)],
            )
            .await?;
        Ok(rows.into_iter().map(Table::from).collect())
    }

    async fn freeze_table(&self, backup_name: &str, table: &Table) -> Result<Vec<FrozenPart>> {
        self.client
            .execute(&format!(
                "ALTER TABLE {}.{} FREEZE WITH NAME {}",
                quote_ident(&table.database),
                quote_ident(&table.name),
                quote_str(backup_name)
            ))
            .await?;

        let disks = self.disks().await?;
        let mut parts = Vec::new();
        for data_path in &table.data_paths {
            let (disk, dir) = frozen_table_dir(&disks, backup_name, data_path)?;
            let disk_name = disk.name.clone();
            let (database, name) = (table.database.clone(), table.name.clone());

            let found = tokio::task::spawn_blocking(move || scan_frozen_parts(&dir, &database, &name, &disk_name))
                .await
                .map_err(|e| BackupError::Clickhouse(format!("part scan failed: {e}")))??;
            parts.extend(found);
        }

        debug!(table = %table.full_name(), parts = parts.len(), "Froze table");
        Ok(parts)
    }

    async fn unfreeze(&self, backup_name: &str) -> Result<()> {
        for disk in self.disks().await? {
            let dir = disk.path.join("shadow").join(backup_name);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(disk = %disk.name, path = %dir.display(), "Removed frozen data"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn create_database(&self, database: &DatabaseInfo) -> Result<()> {
        info!(database = %database.name, "Creating database");
        self.client.execute(&database.create_statement).await
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        info!(table = %table.full_name(), engine = %table.engine, "Creating table");
        self.client.execute(&table.create_statement).await
    }

    async fn drop_table(&self, database: &str, name: &str) -> Result<()> {
        self.client
            .execute(&format!(
                "DROP TABLE IF EXISTS {}.{} SYNC",
                quote_ident(database),
                quote_ident(name)
            ))
            .await
    }

    async fn list_parts(&self, table: &Table) -> Result<Vec<String>> {
        let rows: Vec<PartRow> = self
            .client
            .query(
                "SELECT name FROM system.parts \
                 WHERE database = {db:String} AND table = {table:String} AND active \
                 ORDER BY name",
                &[("db", table.database.as_str()), ("table", table.name.as_str())],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    async fn detached_part_dir(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<PathBuf> {
        self.detached_dir(table, part_name, disk_name).await
    }

    async fn attach_part(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<()> {
        let dir = self.detached_dir(table, part_name, disk_name).await?;
        let (owner, group) = (self.owner.clone(), self.group.clone());
        let chown = tokio::task::spawn_blocking(move || chown_tree(&dir, &owner, &group)).await;
        match chown {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(part = part_name, error = %e, "Could not chown detached part"),
            Err(e) => warn!(part = part_name, error = %e, "Chown task failed"),
        }

        self.client
            .execute(&format!(
                "ALTER TABLE {}.{} ATTACH PART {}",
                quote_ident(&table.database),
                quote_ident(&table.name),
                quote_str(part_name)
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_frozen_parts() {
        let dir = TempDir::new().unwrap();
        let table_dir = dir.path().join("store/abc/abcdef");
        fs::create_dir_all(table_dir.join("all_1_1_0")).unwrap();
        fs::write(table_dir.join("all_1_1_0/data.bin"), b"rows").unwrap();
        fs::write(table_dir.join("all_1_1_0/checksums.txt"), b"sum").unwrap();
        fs::create_dir_all(table_dir.join("all_2_2_0")).unwrap();
        fs::write(table_dir.join("all_2_2_0/data.bin"), b"more rows").unwrap();
        fs::write(table_dir.join("frozen_metadata.txt"), b"1").unwrap();

        let parts = scan_frozen_parts(&table_dir, "db", "t", "default").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "all_1_1_0");
        assert_eq!(parts[0].files.len(), 2);
        assert_eq!(parts[1].size(), 9);
    }

    #[test]
    fn test_table_row_conversion() {
        let row = TableRow {
            database: "db".to_string(),
            name: "t".to_string(),
            engine: "MergeTree".to_string(),
            uuid: NIL_UUID.to_string(),
            create_table_query: "CREATE TABLE db.t (n UInt8) ENGINE = MergeTree ORDER BY n".to_string(),
            data_paths: vec!["/var/lib/clickhouse/data/db/t/".to_string()],
        };
        let table = Table::from(row);
        assert_eq!(table.uuid, None);
        assert_eq!(table.full_name(), "db.t");
    }

    fn disks() -> Vec<Disk> {
        vec![
            Disk {
                name: "default".to_string(),
                path: PathBuf::from("/var/lib/clickhouse/"),
            },
            Disk {
                name: "fast".to_string(),
                path: PathBuf::from("/var/lib/clickhouse/disks/fast/"),
            },
            Disk {
                name: "s3cache".to_string(),
                path: PathBuf::from("/mnt/hdd/clickhouse/"),
            },
        ]
    }

    #[test]
    fn test_frozen_table_dir_per_disk() {
        let disks = disks();

        let (disk, dir) = frozen_table_dir(&disks, "b1", Path::new("/var/lib/clickhouse/store/abc/abcdef/")).unwrap();
        assert_eq!(disk.name, "default");
        assert_eq!(dir, PathBuf::from("/var/lib/clickhouse/shadow/b1/store/abc/abcdef"));

        let (disk, dir) = frozen_table_dir(&disks, "b1", Path::new("/mnt/hdd/clickhouse/store/abc/abcdef/")).unwrap();
        assert_eq!(disk.name, "s3cache");
        assert_eq!(dir, PathBuf::from("/mnt/hdd/clickhouse/shadow/b1/store/abc/abcdef"));

        // Nested disk paths resolve to the innermost disk.
        let (disk, _) = frozen_table_dir(&disks, "b1", Path::new("/var/lib/clickhouse/disks/fast/store/abc/x/")).unwrap();
        assert_eq!(disk.name, "fast");

        assert!(frozen_table_dir(&disks, "b1", Path::new("/elsewhere/t")).is_err());
    }

    #[test]
    fn test_data_path_on_disk() {
        let disks = disks();
        let paths = vec![
            PathBuf::from("/var/lib/clickhouse/store/abc/abcdef/"),
            PathBuf::from("/mnt/hdd/clickhouse/store/abc/abcdef/"),
        ];

        assert_eq!(data_path_on_disk(&paths, &disks, "s3cache"), Some(paths[1].as_path()));
        assert_eq!(data_path_on_disk(&paths, &disks, "default"), Some(paths[0].as_path()));
        assert_eq!(data_path_on_disk(&paths, &disks, "fast"), None);
        assert_eq!(data_path_on_disk(&paths, &disks, "unknown"), None);
    }
}
