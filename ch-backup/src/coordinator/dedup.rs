//! Index of chunks already present in storage.
//!
//! Built from one listing of the chunk prefix at the start of a backup; the
//! object store itself is the durable copy of the index.

use super::chunk::ChunkId;
use super::layout::Layout;
use crate::storage::StorageClient;
use crate::utils::errors::Result;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::info;

/// Outcome of claiming a chunk for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Stored by an earlier backup
    Known,
    /// Another file of the running backup is uploading it
    InFlight,
    /// Caller must upload it
    Upload,
}

#[derive(Debug, Default)]
struct IndexState {
    known: HashSet<ChunkId>,
    in_flight: HashSet<ChunkId>,
}

#[derive(Debug, Default)]
pub struct DedupIndex {
    state: Mutex<IndexState>,
}

impl DedupIndex {
    /// An index that knows nothing, so every chunk gets uploaded once.
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn load(storage: &StorageClient, layout: &Layout) -> Result<Self> {
        let known: HashSet<ChunkId> = storage
            .list(&layout.chunks_prefix())
            .await?
            .iter()
            .filter_map(|obj| layout.chunk_id(&obj.key))
            .collect();

        info!(chunks = known.len(), "Loaded deduplication index");
        Ok(Self {
            state: Mutex::new(IndexState {
                known,
                in_flight: HashSet::new(),
            }),
        })
    }

    pub async fn claim(&self, id: &ChunkId) -> Claim {
        let mut state = self.state.lock().await;
        if state.known.contains(id) {
            Claim::Known
        } else if !state.in_flight.insert(id.clone()) {
            Claim::InFlight
        } else {
            Claim::Upload
        }
    }

    /// Record a finished upload.
    pub async fn complete(&self, id: &ChunkId) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(id);
        state.known.insert(id.clone());
    }

    /// Give up a claim after a failed upload.
    pub async fn release(&self, id: &ChunkId) {
        self.state.lock().await.in_flight.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.known.len()
    }
}
