//! Object key layout.
//!
//! ```text
//! {path_root}backups/{name}/backup_struct.json
//! {path_root}backups/{name}/backup.lock
//! {path_root}chunks/{id[..2]}/{id}
//! ```

use super::chunk::ChunkId;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};

const MANIFEST_FILE: &str = "backup_struct.json";
const LOCK_FILE: &str = "backup.lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

impl Layout {
    pub fn new(path_root: &str) -> Self {
        let trimmed = path_root.trim_matches('/');
        let root = if trimmed.is_empty() { String::new() } else { format!("{trimmed}/") };
        Self { root }
    }

    pub fn backups_prefix(&self) -> String {
        format!("{}backups/", self.root)
    }

    pub fn manifest_key(&self, name: &str) -> String {
        format!("{}{name}/{MANIFEST_FILE}", self.backups_prefix())
    }

    /// Claimed with a conditional create before a backup writes anything
    pub fn lock_key(&self, name: &str) -> String {
        format!("{}{name}/{LOCK_FILE}", self.backups_prefix())
    }

    pub fn chunks_prefix(&self) -> String {
        format!("{}chunks/", self.root)
    }

    pub fn chunk_key(&self, id: &ChunkId) -> String {
        format!("{}{}/{}", self.chunks_prefix(), id.shard(), id)
    }

    /// Backup name of a manifest key, `None` for other keys
    pub fn backup_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(&self.backups_prefix())?;
        let name = rest.strip_suffix(MANIFEST_FILE)?.strip_suffix('/')?;
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }

    /// Chunk id of a chunk key, `None` for other keys
    pub fn chunk_id(&self, key: &str) -> Option<ChunkId> {
        let rest = key.strip_prefix(&self.chunks_prefix())?;
        let (shard, id) = rest.split_once('/')?;
        ChunkId::parse(id).filter(|id| id.shard() == shard)
    }
}

/// Expand `{timestamp}` and `{uuid}` in a backup name template.
pub fn render_name(template: &str, now: DateTime<Utc>) -> Result<String> {
    let name = template
        .replace("{timestamp}", &now.format("%Y%m%dT%H%M%S").to_string())
        .replace("{uuid}", &uuid::Uuid::new_v4().to_string());
    validate_name(&name)?;
    Ok(name)
}

/// Names become object keys and freeze names, so keep them path-safe.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BackupError::Configuration(format!(
            "invalid backup name {name:?}: use letters, digits, '_', '-' and '.'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_keys_round_trip() {
        let layout = Layout::new("/ch_backup/");
        let id = ChunkId::of(b"data");

        let key = layout.chunk_key(&id);
        assert!(key.starts_with("ch_backup/chunks/"));
        assert_eq!(layout.chunk_id(&key), Some(id));

        let manifest = layout.manifest_key("20240101T000000");
        assert_eq!(manifest, "ch_backup/backups/20240101T000000/backup_struct.json");
        assert_eq!(layout.backup_name(&manifest), Some("20240101T000000"));
    }

    #[test]
    fn test_foreign_keys_are_ignored() {
        let layout = Layout::new("ch_backup");
        assert_eq!(layout.backup_name("ch_backup/backups/b1/other.json"), None);
        assert_eq!(layout.backup_name(&layout.lock_key("b1")), None);
        assert_eq!(layout.backup_name("ch_backup/backups/a/b/backup_struct.json"), None);
        assert_eq!(layout.chunk_id("ch_backup/chunks/zz/not-a-hash"), None);
        assert_eq!(layout.chunk_id("other/chunks/ab/ab"), None);
    }

    #[test]
    fn test_empty_root() {
        let layout = Layout::new("");
        assert_eq!(layout.manifest_key("b"), "backups/b/backup_struct.json");
    }

    #[test]
    fn test_render_name() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(render_name("{timestamp}", now).unwrap(), "20240301T123005");

        let with_uuid = render_name("nightly-{uuid}", now).unwrap();
        assert!(with_uuid.starts_with("nightly-") && with_uuid.len() == 8 + 36);

        assert!(render_name("../escape", now).is_err());
        assert!(render_name("", now).is_err());
    }
}
