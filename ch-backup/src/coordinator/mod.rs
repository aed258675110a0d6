//! Backup, restore and retention logic on top of storage and ClickHouse.

pub mod backup;
pub mod catalog;
pub mod chunk;
pub mod dedup;
pub mod layout;
pub mod manifest;
pub mod restore;
pub mod retention;

pub use backup::{BackupCoordinator, BackupOptions};
pub use catalog::{BackupCatalog, BackupSelector};
pub use chunk::ChunkId;
pub use layout::Layout;
pub use manifest::{BackupState, Manifest};
pub use restore::{AttachFailurePolicy, ReplicaNameStrategy, RestoreCoordinator, RestoreReport, RestoreTarget};
pub use retention::{PurgeReport, RetentionManager, RetentionPolicy, SweepReport};
