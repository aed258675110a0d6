//! Shared fixtures: a ClickHouse node backed by a temp directory and a
//! storage client over the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use ch_backup::clickhouse::{ClickhouseControl, DatabaseInfo, FrozenFile, FrozenPart, Table};
use ch_backup::codec::Codec;
use ch_backup::config::{Config, EncryptionType, StorageType};
use ch_backup::fs::walker::{list_subdirs, walk_files, WalkOptions};
use ch_backup::storage::memory::MemoryStore;
use ch_backup::storage::StorageClient;
use ch_backup::{BackupError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const KEY: &str = "0123456789abcdef0123456789abcdef";

/// `(database, table) -> (create statement, part -> file -> bytes)`
pub type Snapshot = BTreeMap<(String, String), (String, BTreeMap<String, BTreeMap<String, Vec<u8>>>)>;

#[derive(Default)]
struct NodeState {
    databases: BTreeMap<String, DatabaseInfo>,
    tables: BTreeMap<(String, String), Table>,
    fail_freeze: HashSet<String>,
    vanish_on_freeze: HashSet<String>,
    fail_attach: HashSet<String>,
    freezes: usize,
}

/// A ClickHouse node whose tables are directories of part directories.
pub struct FakeNode {
    pub name: String,
    dir: TempDir,
    state: Mutex<NodeState>,
}

impl FakeNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: TempDir::new().unwrap(),
            state: Mutex::new(NodeState::default()),
        }
    }

    fn data_path(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn table_path(&self, db: &str, table: &str) -> PathBuf {
        self.data_path().join("store").join(db).join(table)
    }

    /// Root of a named disk; `default` is the data path itself.
    fn disk_root(&self, disk: &str) -> PathBuf {
        if disk == "default" {
            self.data_path()
        } else {
            self.dir.path().join("disks").join(disk)
        }
    }

    fn disk_of(&self, data_path: &Path) -> String {
        data_path
            .strip_prefix(self.dir.path().join("disks"))
            .ok()
            .and_then(|rest| rest.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string())
    }

    fn disk_names(&self) -> Vec<String> {
        let mut names = vec!["default".to_string()];
        if let Ok(dirs) = list_subdirs(&self.dir.path().join("disks")) {
            names.extend(dirs.iter().map(|d| d.file_name().unwrap().to_string_lossy().into_owned()));
        }
        names
    }

    fn data_path_on(&self, table: &Table, disk: &str) -> PathBuf {
        table
            .data_paths
            .iter()
            .find(|p| self.disk_of(p) == disk)
            .unwrap_or(&table.data_paths[0])
            .clone()
    }

    pub fn add_database(&self, name: &str) {
        self.state.lock().unwrap().databases.insert(
            name.to_string(),
            DatabaseInfo {
                name: name.to_string(),
                engine: "Atomic".to_string(),
                create_statement: format!("CREATE DATABASE {name} ENGINE = Atomic"),
            },
        );
    }

    pub fn add_table(&self, db: &str, name: &str, engine: &str, create_statement: &str) {
        let path = self.table_path(db, name);
        std::fs::create_dir_all(&path).unwrap();
        self.state.lock().unwrap().tables.insert(
            (db.to_string(), name.to_string()),
            Table {
                database: db.to_string(),
                name: name.to_string(),
                engine: engine.to_string(),
                uuid: None,
                create_statement: create_statement.to_string(),
                data_paths: vec![path],
            },
        );
    }

    pub fn add_merge_tree(&self, db: &str, name: &str) {
        self.add_table(
            db,
            name,
            "MergeTree",
            &format!("CREATE TABLE {db}.{name} (`n` UInt32, `s` String) ENGINE = MergeTree ORDER BY n"),
        );
    }

    /// Give a table a second data path on another disk.
    pub fn add_disk_path(&self, db: &str, table: &str, disk: &str) {
        let path = self.disk_root(disk).join("store").join(db).join(table);
        std::fs::create_dir_all(&path).unwrap();
        let mut state = self.state.lock().unwrap();
        let entry = state.tables.get_mut(&(db.to_string(), table.to_string())).unwrap();
        entry.data_paths.push(path);
    }

    pub fn add_part(&self, db: &str, table: &str, part: &str, files: &[(&str, &[u8])]) {
        self.add_part_on_disk(db, table, "default", part, files);
    }

    pub fn add_part_on_disk(&self, db: &str, table: &str, disk: &str, part: &str, files: &[(&str, &[u8])]) {
        let dir = self.disk_root(disk).join("store").join(db).join(table).join(part);
        for (name, data) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
    }

    pub fn fail_freeze(&self, db: &str, table: &str, fail: bool) {
        let key = format!("{db}.{table}");
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_freeze.insert(key);
        } else {
            state.fail_freeze.remove(&key);
        }
    }

    /// Drop the table the moment someone tries to freeze it.
    pub fn vanish_on_freeze(&self, db: &str, table: &str) {
        self.state.lock().unwrap().vanish_on_freeze.insert(format!("{db}.{table}"));
    }

    /// Disk an attached part lives on
    pub fn part_disk(&self, db: &str, table: &str, part: &str) -> Option<String> {
        let table = self.table(db, table)?;
        table
            .data_paths
            .iter()
            .find(|p| p.join(part).is_dir())
            .map(|p| self.disk_of(p))
    }

    pub fn fail_attach(&self, part: &str) {
        self.state.lock().unwrap().fail_attach.insert(part.to_string());
    }

    pub fn freeze_count(&self) -> usize {
        self.state.lock().unwrap().freezes
    }

    pub fn table(&self, db: &str, name: &str) -> Option<Table> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&(db.to_string(), name.to_string()))
            .cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.state.lock().unwrap().databases.keys().cloned().collect()
    }

    pub fn shadow_is_empty(&self) -> bool {
        self.disk_names().iter().all(|disk| {
            walk_files(&self.disk_root(disk).join("shadow"), &WalkOptions::default())
                .unwrap()
                .is_empty()
        })
    }

    pub fn detached_is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.tables.values().all(|t| {
            t.data_paths
                .iter()
                .all(|p| list_subdirs(&p.join("detached")).unwrap().is_empty())
        })
    }

    /// Schema and attached data of every table
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        let mut snapshot = Snapshot::new();
        for ((db, name), table) in &state.tables {
            let mut parts = BTreeMap::new();
            for part_dir in table.data_paths.iter().flat_map(|p| list_subdirs(p).unwrap()) {
                let part = part_dir.file_name().unwrap().to_string_lossy().into_owned();
                if part == "detached" {
                    continue;
                }
                let files = walk_files(&part_dir, &WalkOptions::default())
                    .unwrap()
                    .into_iter()
                    .map(|f| (f.relative_key(), std::fs::read(&f.path).unwrap()))
                    .collect();
                parts.insert(part, files);
            }
            snapshot.insert((db.clone(), name.clone()), (table.create_statement.clone(), parts));
        }
        snapshot
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<Vec<FrozenFile>> {
    let mut files = Vec::new();
    for file in walk_files(from, &WalkOptions::default())? {
        let dest = to.join(&file.relative_path);
        std::fs::create_dir_all(dest.parent().unwrap())?;
        std::fs::copy(&file.path, &dest)?;
        files.push(FrozenFile {
            name: file.relative_key(),
            path: dest,
            size: file.size,
        });
    }
    Ok(files)
}

#[async_trait]
impl ClickhouseControl for FakeNode {
    async fn version(&self) -> Result<String> {
        Ok("23.8.1.94".to_string())
    }

    async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        Ok(self.state.lock().unwrap().databases.values().cloned().collect())
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<Table>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .values()
            .filter(|t| t.database == database)
            .cloned()
            .collect())
    }

    async fn freeze_table(&self, backup_name: &str, table: &Table) -> Result<Vec<FrozenPart>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_freeze.contains(&table.full_name()) {
                return Err(BackupError::Clickhouse(format!("cannot freeze {}", table.full_name())));
            }
            if state.vanish_on_freeze.contains(&table.full_name()) {
                state.tables.remove(&(table.database.clone(), table.name.clone()));
                return Err(BackupError::Clickhouse(format!(
                    "Code: 60. Table {} doesn't exist",
                    table.full_name()
                )));
            }
            state.freezes += 1;
        }

        let mut parts = Vec::new();
        for data_path in &table.data_paths {
            let disk = self.disk_of(data_path);
            let shadow = self
                .disk_root(&disk)
                .join("shadow")
                .join(backup_name)
                .join(&table.database)
                .join(&table.name);
            for part_dir in list_subdirs(data_path)? {
                let name = part_dir.file_name().unwrap().to_string_lossy().into_owned();
                if name == "detached" {
                    continue;
                }
                let frozen_dir = shadow.join(&name);
                let files = copy_tree(&part_dir, &frozen_dir)?;
                parts.push(FrozenPart {
                    database: table.database.clone(),
                    table: table.name.clone(),
                    name,
                    disk_name: disk.clone(),
                    path: frozen_dir,
                    files,
                });
            }
        }
        Ok(parts)
    }

    async fn unfreeze(&self, backup_name: &str) -> Result<()> {
        for disk in self.disk_names() {
            let shadow = self.disk_root(&disk).join("shadow").join(backup_name);
            if shadow.exists() {
                std::fs::remove_dir_all(shadow)?;
            }
        }
        Ok(())
    }

    async fn create_database(&self, database: &DatabaseInfo) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .databases
            .insert(database.name.clone(), database.clone());
        Ok(())
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.databases.contains_key(&table.database) {
            return Err(BackupError::Clickhouse(format!("database {} does not exist", table.database)));
        }
        let key = (table.database.clone(), table.name.clone());
        if state.tables.contains_key(&key) {
            return Err(BackupError::Clickhouse(format!("table {} already exists", table.full_name())));
        }

        let path = self.table_path(&table.database, &table.name);
        std::fs::create_dir_all(&path)?;
        let mut created = table.clone();
        created.data_paths = vec![path];
        state.tables.insert(key, created);
        Ok(())
    }

    async fn drop_table(&self, database: &str, name: &str) -> Result<()> {
        let removed = self
            .state
            .lock()
            .unwrap()
            .tables
            .remove(&(database.to_string(), name.to_string()));
        if let Some(table) = removed {
            for path in &table.data_paths {
                std::fs::remove_dir_all(path)?;
            }
        }
        Ok(())
    }

    async fn list_parts(&self, table: &Table) -> Result<Vec<String>> {
        let mut parts = Vec::new();
        for path in &table.data_paths {
            for part_dir in list_subdirs(path)? {
                let name = part_dir.file_name().unwrap().to_string_lossy().into_owned();
                if name != "detached" {
                    parts.push(name);
                }
            }
        }
        Ok(parts)
    }

    async fn detached_part_dir(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<PathBuf> {
        Ok(self.data_path_on(table, disk_name).join("detached").join(part_name))
    }

    async fn attach_part(&self, table: &Table, part_name: &str, disk_name: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_attach.contains(part_name) {
            return Err(BackupError::Clickhouse(format!("checksum mismatch in part {part_name}")));
        }
        let data_path = self.data_path_on(table, disk_name);
        std::fs::rename(data_path.join("detached").join(part_name), data_path.join(part_name))?;
        Ok(())
    }
}

/// Configuration for tests: in-memory storage, NaCl encryption, no grace
/// period, fast retries.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.kind = StorageType::Memory;
    config.storage.retry.initial_interval_ms = 1;
    config.storage.retry.max_interval_ms = 2;
    config.encryption.kind = EncryptionType::Nacl;
    config.encryption.key = Some(KEY.to_string());
    config.backup.gc_grace_period = "0s".to_string();
    config.backup.max_concurrency = 4;
    config.validate().unwrap();
    config
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub storage: Arc<StorageClient>,
    pub config: Arc<Config>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let storage = StorageClient::new(
            store.clone(),
            Codec::from_config(&config).unwrap(),
            config.storage.retry_policy(),
            config.storage.chunk_size,
        );
        Self {
            store,
            storage: Arc::new(storage),
            config: Arc::new(config),
        }
    }

    pub async fn chunk_keys(&self) -> Vec<String> {
        let prefix = format!("{}chunks/", self.config.backup.path_root);
        self.store
            .keys()
            .await
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect()
    }
}

/// The schema and data used by the end-to-end scenario.
pub fn seed_scenario(node: &FakeNode) {
    node.add_database("test_db");
    node.add_merge_tree("test_db", "table_01");
    node.add_part(
        "test_db",
        "table_01",
        "all_1_1_0",
        &[
            ("checksums.txt", b"checksums v1"),
            ("columns.txt", b"columns format version: 1\n2 columns:\n`n` UInt32\n`s` String\n"),
            ("data.bin", b"\x01\x00\x00\x00\x02\x00\x00\x00"),
            ("data.mrk3", b"marks"),
        ],
    );
    node.add_part(
        "test_db",
        "table_01",
        "all_2_2_0",
        &[
            ("checksums.txt", b"checksums v2"),
            ("columns.txt", b"columns format version: 1\n2 columns:\n`n` UInt32\n`s` String\n"),
            ("data.bin", b"\x03\x00\x00\x00"),
            ("data.mrk3", b"marks"),
        ],
    );
    node.add_table(
        "test_db",
        "view_01",
        "View",
        "CREATE VIEW test_db.view_01 AS SELECT n FROM test_db.table_01",
    );
}
