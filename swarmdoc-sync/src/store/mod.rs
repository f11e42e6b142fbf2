//! Content-addressed blob storage for change sets.
//!
//! ```text
//! put(bytes) ──► ChangeId::of(bytes) ──► blobs[id] = bytes
//! get(id)    ──► blobs[id] | None
//! ```
//!
//! Ids are a pure function of content, so every peer derives the same id
//! for the same change set and a `put` of already-stored bytes is a no-op.
//!
//! - [`MemoryStore`]: in-process map, shared by reference across replicas
//! - [`BlobStore`]: RocksDB-backed, LZ4-compressed, survives restarts

pub mod blob;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::protocol::ChangeId;

pub use blob::{BlobMetadata, BlobStats, BlobStore};

/// Blob store shared by every replica of a node.
///
/// Implementations must be safe under concurrent use from independent
/// fetch tasks.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes`, returning their content address.
    async fn put(&self, bytes: Vec<u8>) -> Result<ChangeId, StoreError>;

    /// Fetch the blob stored under `id`. `Ok(None)` means not found.
    async fn get(&self, id: &ChangeId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn contains(&self, id: &ChangeId) -> Result<bool, StoreError> {
        Ok(self.get(id).await?.is_some())
    }
}

/// In-memory content store.
///
/// Clones share the same underlying map, so one instance can stand in for
/// a blob network reachable by several nodes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<ChangeId, Arc<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Total bytes stored.
    pub async fn total_bytes(&self) -> usize {
        self.blobs.read().await.values().map(|b| b.len()).sum()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ChangeId, StoreError> {
        let id = ChangeId::of(&bytes);
        self.blobs
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| Arc::new(bytes));
        Ok(id)
    }

    async fn get(&self, id: &ChangeId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().await.get(id).map(|b| b.as_ref().clone()))
    }

    async fn contains(&self, id: &ChangeId) -> Result<bool, StoreError> {
        Ok(self.blobs.read().await.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_get() {
        let store = MemoryStore::new();
        let id = store.put(b"change".to_vec()).await.unwrap();

        assert_eq!(id, ChangeId::of(b"change"));
        assert_eq!(store.get(&id).await.unwrap(), Some(b"change".to_vec()));
        assert!(store.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_missing_is_none() {
        let store = MemoryStore::new();
        let id = ChangeId::of(b"never stored");
        assert_eq!(store.get(&id).await.unwrap(), None);
        assert!(!store.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_put_dedupes() {
        let store = MemoryStore::new();
        let a = store.put(vec![1, 2, 3]).await.unwrap();
        let b = store.put(vec![1, 2, 3]).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.total_bytes().await, 3);
    }

    #[tokio::test]
    async fn test_memory_clones_share_blobs() {
        let store = MemoryStore::new();
        let other = store.clone();
        let id = store.put(vec![9]).await.unwrap();

        assert_eq!(other.get(&id).await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_arc_dyn_store() {
        let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
        let id = store.put(vec![4, 2]).await.unwrap();
        assert!(store.contains(&id).await.unwrap());
    }
}
