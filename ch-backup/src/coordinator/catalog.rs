//! Listing, lookup and persistence of backup manifests.

use super::layout::Layout;
use super::manifest::{BackupState, Manifest};
use crate::storage::StorageClient;
use crate::utils::errors::{BackupError, Result};
use bytes::Bytes;
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// How a user refers to a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSelector {
    Name(String),
    /// The newest created backup
    Last,
    /// Position in the newest-first listing, unless a created backup carries
    /// exactly this number as its name
    Index(usize),
}

impl FromStr for BackupSelector {
    type Err = std::convert::Infallible;

    /// `LAST`, a canonical decimal index, or a name. `name:<name>` always
    /// selects by name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("name:") {
            return Ok(BackupSelector::Name(name.to_string()));
        }
        if s == "LAST" {
            return Ok(BackupSelector::Last);
        }
        match s.parse::<usize>() {
            Ok(index) if index.to_string() == s => Ok(BackupSelector::Index(index)),
            _ => Ok(BackupSelector::Name(s.to_string())),
        }
    }
}

/// Newest first; equal start times fall back to name, larger first.
pub fn newest_first(a: &Manifest, b: &Manifest) -> Ordering {
    b.meta
        .start_time
        .cmp(&a.meta.start_time)
        .then_with(|| b.meta.name.cmp(&a.meta.name))
}

#[derive(Clone)]
pub struct BackupCatalog {
    storage: Arc<StorageClient>,
    layout: Layout,
}

impl BackupCatalog {
    pub fn new(storage: Arc<StorageClient>, layout: Layout) -> Self {
        Self { storage, layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// All manifests in any state, newest first. Unreadable manifests are
    /// skipped with a warning.
    pub async fn list_all(&self) -> Result<Vec<Manifest>> {
        self.collect(false).await
    }

    /// Like [`list_all`](Self::list_all) but fails on the first manifest
    /// that cannot be read or parsed. Anything that deletes chunks must see
    /// every manifest.
    pub async fn list_strict(&self) -> Result<Vec<Manifest>> {
        self.collect(true).await
    }

    async fn collect(&self, strict: bool) -> Result<Vec<Manifest>> {
        let objects = self.storage.list(&self.layout.backups_prefix()).await?;

        let mut manifests = Vec::new();
        for object in objects {
            let Some(name) = self.layout.backup_name(&object.key) else {
                continue;
            };
            match self.load(name).await {
                Ok(manifest) => manifests.push(manifest),
                Err(BackupError::BackupNotFound(_)) => {}
                Err(e) if strict => {
                    return Err(BackupError::UnreadableManifest {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => warn!(backup = name, error = %e, "Skipping unreadable manifest"),
            }
        }

        manifests.sort_by(newest_first);
        Ok(manifests)
    }

    /// Manifests that can be restored, newest first
    pub async fn list_created(&self) -> Result<Vec<Manifest>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(Manifest::is_restorable)
            .collect())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.storage.exists(&self.layout.manifest_key(name)).await
    }

    pub async fn load(&self, name: &str) -> Result<Manifest> {
        match self.storage.get_raw(&self.layout.manifest_key(name)).await {
            Ok(data) => Manifest::from_json(&data),
            Err(BackupError::Storage(e)) if e.is_not_found() => Err(BackupError::BackupNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Resolve a selector against created backups only.
    pub async fn resolve(&self, selector: &BackupSelector) -> Result<Manifest> {
        match selector {
            BackupSelector::Name(name) => {
                let manifest = self.load(name).await?;
                if manifest.is_restorable() {
                    Ok(manifest)
                } else {
                    Err(BackupError::BackupNotFound(format!(
                        "{name} (state {})",
                        manifest.meta.state.as_str()
                    )))
                }
            }
            BackupSelector::Last => self
                .list_created()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| BackupError::BackupNotFound("LAST (there are no backups)".to_string())),
            BackupSelector::Index(index) => {
                let mut created = self.list_created().await?;
                let as_name = index.to_string();
                if let Some(pos) = created.iter().position(|m| m.name() == as_name) {
                    return Ok(created.swap_remove(pos));
                }
                created
                    .into_iter()
                    .nth(*index)
                    .ok_or_else(|| BackupError::BackupNotFound(format!("backup #{index}")))
            }
        }
    }

    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        let json = manifest.to_json()?;
        self.storage
            .put_raw(&self.layout.manifest_key(manifest.name()), Bytes::from(json))
            .await
    }

    pub async fn set_state(&self, manifest: &mut Manifest, state: BackupState) -> Result<()> {
        manifest.meta.state = state;
        self.save(manifest).await
    }

    /// Remove the manifest and any lock left next to it.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.storage.delete(&self.layout.manifest_key(name)).await?;
        self.storage.delete(&self.layout.lock_key(name)).await
    }

    /// Claim `name` for a new backup run identified by `owner`.
    pub async fn lock(&self, name: &str, owner: &str) -> Result<bool> {
        let key = self.layout.lock_key(name);
        if self.storage.put_if_absent(&key, Bytes::from(owner.to_string())).await? {
            return Ok(true);
        }
        // The holder may be this run, if a retried create lost its response.
        match self.storage.get_raw(&key).await {
            Ok(holder) => Ok(holder.as_ref() == owner.as_bytes()),
            Err(BackupError::Storage(e)) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn unlock(&self, name: &str) -> Result<()> {
        self.storage.delete(&self.layout.lock_key(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encryption::Cipher, Codec};
    use crate::config::CompressionType;
    use crate::coordinator::manifest::tests::meta;
    use crate::storage::memory::MemoryStore;
    use crate::utils::retry::RetryPolicy;
    use chrono::{Duration, Utc};

    fn catalog() -> BackupCatalog {
        let storage = StorageClient::new(
            Arc::new(MemoryStore::new()),
            Codec::new(CompressionType::None, 0, Cipher::plain(), 1024),
            RetryPolicy::default(),
            1 << 20,
        );
        BackupCatalog::new(Arc::new(storage), Layout::new("ch_backup/"))
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("LAST".parse::<BackupSelector>().unwrap(), BackupSelector::Last);
        assert_eq!("0".parse::<BackupSelector>().unwrap(), BackupSelector::Index(0));
        assert_eq!(
            "20240101T000000".parse::<BackupSelector>().unwrap(),
            BackupSelector::Name("20240101T000000".to_string())
        );
        assert_eq!(
            "name:3".parse::<BackupSelector>().unwrap(),
            BackupSelector::Name("3".to_string())
        );
        assert_eq!("007".parse::<BackupSelector>().unwrap(), BackupSelector::Name("007".to_string()));
    }

    #[tokio::test]
    async fn test_numeric_names_are_selectable() {
        let catalog = catalog();
        let now = Utc::now();
        catalog.save(&Manifest::new(meta("5", now - Duration::hours(1)))).await.unwrap();
        catalog.save(&Manifest::new(meta("latest", now))).await.unwrap();

        assert_eq!(catalog.resolve(&"5".parse().unwrap()).await.unwrap().name(), "5");
        assert_eq!(catalog.resolve(&"name:5".parse().unwrap()).await.unwrap().name(), "5");
        assert_eq!(catalog.resolve(&"1".parse().unwrap()).await.unwrap().name(), "5");
        assert_eq!(catalog.resolve(&"0".parse().unwrap()).await.unwrap().name(), "latest");
    }

    #[tokio::test]
    async fn test_strict_listing_rejects_unknown_state() {
        let catalog = catalog();
        catalog.save(&Manifest::new(meta("good", Utc::now()))).await.unwrap();
        let json = Manifest::new(meta("odd", Utc::now())).to_json().unwrap();
        let odd = String::from_utf8(json).unwrap().replace("\"created\"", "\"archived\"");
        catalog
            .storage
            .put_raw(&catalog.layout.manifest_key("odd"), Bytes::from(odd))
            .await
            .unwrap();

        assert_eq!(catalog.list_all().await.unwrap().len(), 1);
        assert!(matches!(
            catalog.list_strict().await,
            Err(BackupError::UnreadableManifest { ref name, .. }) if name == "odd"
        ));
    }

    #[tokio::test]
    async fn test_newest_first_and_resolution() {
        let catalog = catalog();
        let now = Utc::now();

        catalog.save(&Manifest::new(meta("old", now - Duration::hours(2)))).await.unwrap();
        catalog.save(&Manifest::new(meta("new", now))).await.unwrap();
        let mut failed = Manifest::new(meta("broken", now + Duration::hours(1)));
        failed.meta.state = BackupState::Failed;
        catalog.save(&failed).await.unwrap();

        let all: Vec<String> = catalog.list_all().await.unwrap().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(all, vec!["broken", "new", "old"]);

        assert_eq!(catalog.resolve(&BackupSelector::Index(0)).await.unwrap().name(), "new");
        assert_eq!(catalog.resolve(&BackupSelector::Last).await.unwrap().name(), "new");
        assert_eq!(catalog.resolve(&BackupSelector::Index(1)).await.unwrap().name(), "old");
        assert!(matches!(
            catalog.resolve(&BackupSelector::Index(2)).await,
            Err(BackupError::BackupNotFound(_))
        ));
        assert!(matches!(
            catalog.resolve(&BackupSelector::Name("broken".to_string())).await,
            Err(BackupError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_same_start_time_orders_by_name() {
        let catalog = catalog();
        let now = Utc::now();
        catalog.save(&Manifest::new(meta("a", now))).await.unwrap();
        catalog.save(&Manifest::new(meta("b", now))).await.unwrap();

        let names: Vec<String> = catalog.list_created().await.unwrap().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_lock_has_one_holder() {
        let catalog = catalog();
        assert!(catalog.lock("b1", "run-a").await.unwrap());
        assert!(catalog.lock("b1", "run-a").await.unwrap());
        assert!(!catalog.lock("b1", "run-b").await.unwrap());
        assert!(catalog.list_all().await.unwrap().is_empty());

        catalog.unlock("b1").await.unwrap();
        assert!(catalog.lock("b1", "run-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_backup() {
        assert!(matches!(catalog().load("nope").await, Err(BackupError::BackupNotFound(_))));
    }
}
