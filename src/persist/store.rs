//! The durable key/value contract for cycle progress, plus an in-memory
//! implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use super::record::StorageRecord;
use crate::types::PollerId;

/// Errors from a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error from the backing medium.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored record was written by an incompatible format version.
    #[error("record format mismatch: expected {expected}, got {got}")]
    FormatMismatch {
        /// The version this build reads.
        expected: u32,
        /// The version found on disk.
        got: u32,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable store for poller progress records.
///
/// Keys are stable poller instance ids; each engine only ever reads and
/// writes its own key, so implementations may be shared across many poller
/// instances without coordination beyond per-key atomicity. One-shot engines
/// never call this interface.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the record for a poller, or `None` if nothing is stored.
    async fn get(&self, key: &PollerId) -> Result<Option<StorageRecord>>;

    /// Replaces the record for a poller.
    async fn set(&self, key: &PollerId, record: &StorageRecord) -> Result<()>;

    /// Deletes the record for a poller. Deleting a missing key is not an
    /// error.
    async fn remove(&self, key: &PollerId) -> Result<()>;
}

/// In-memory store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<PollerId, StorageRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &PollerId) -> Result<Option<StorageRecord>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &PollerId, record: &StorageRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(key.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, key: &PollerId) -> Result<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::record::CheckpointPhase;
    use crate::types::{CycleState, PollerStats};
    use chrono::Utc;

    fn record() -> StorageRecord {
        StorageRecord::new(
            CheckpointPhase::Schedule,
            Utc::now(),
            PollerStats::default(),
            CycleState::new(1),
        )
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemoryStore::new();
        assert!(store.get(&PollerId::new("p1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        let key = PollerId::new("p1");
        let rec = record();

        store.set(&key, &rec).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn remove_deletes_and_is_idempotent() {
        let store = MemoryStore::new();
        let key = PollerId::new("p1");
        store.set(&key, &record()).await.unwrap();

        store.remove(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        store.remove(&key).await.unwrap();
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let store = MemoryStore::new();
        store.set(&PollerId::new("a"), &record()).await.unwrap();

        assert!(store.get(&PollerId::new("b")).await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }
}
