//! In-memory backend.
//!
//! Entries are bucketed by [`key_digest`]; lookups scan the bucket for an
//! exact key match, so digest collisions never conflate keys. Nothing
//! survives a restart: the materializer rebuilds the map from the log.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kvlog_core::config::StorageBackend;
use kvlog_core::{KeyValueEntry, StoredValue, TopicPartitionOffset, key_digest};
use tracing::debug;

use crate::error::StateResult;
use crate::readiness::ReadinessLatch;
use crate::store::{StateStore, sort_ledger};

#[derive(Debug, Default)]
struct MemoryState {
    buckets: HashMap<String, Vec<KeyValueEntry>>,
    ledger: Vec<TopicPartitionOffset>,
}

/// Collision-bucket map behind a single lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    readiness: ReadinessLatch,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.lock().buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Dict
    }

    async fn store(&self, key: &[u8], value: &[u8], correlation_id: &str) -> StateResult<()> {
        let digest = key_digest(key);
        let mut state = self.lock();
        let bucket = state.buckets.entry(digest.clone()).or_default();
        match bucket.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => {
                entry.value = value.to_vec();
                entry.correlation_id = correlation_id.to_string();
            }
            None => bucket.push(KeyValueEntry {
                key: key.to_vec(),
                value: value.to_vec(),
                correlation_id: correlation_id.to_string(),
            }),
        }
        debug!(%digest, %correlation_id, "value stored");
        Ok(())
    }

    async fn try_retrieve(&self, key: &[u8]) -> StateResult<Option<StoredValue>> {
        let state = self.lock();
        Ok(state
            .buckets
            .get(&key_digest(key))
            .and_then(|bucket| bucket.iter().find(|entry| entry.key == key))
            .cloned()
            .map(StoredValue::from))
    }

    async fn remove(&self, key: &[u8], correlation_id: &str) -> StateResult<()> {
        let digest = key_digest(key);
        let mut state = self.lock();
        if let Some(bucket) = state.buckets.get_mut(&digest) {
            bucket.retain(|entry| entry.key != key);
            if bucket.is_empty() {
                state.buckets.remove(&digest);
            }
        }
        debug!(%digest, %correlation_id, "value removed");
        Ok(())
    }

    async fn last_consumed_offsets(&self) -> StateResult<Vec<TopicPartitionOffset>> {
        let mut rows = self.lock().ledger.clone();
        sort_ledger(&mut rows);
        Ok(rows)
    }

    async fn update_last_consumed_offset(
        &self,
        position: &TopicPartitionOffset,
    ) -> StateResult<()> {
        let mut state = self.lock();
        match state.ledger.iter_mut().find(|row| row.same_partition(position)) {
            Some(row) => row.offset = position.offset,
            None => state.ledger.push(position.clone()),
        }
        Ok(())
    }

    fn readiness(&self) -> &ReadinessLatch {
        &self.readiness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_retrieve_remove() {
        let store = MemoryStore::new();
        store.store(b"k1", b"v1", "c1").await.unwrap();
        let hit = store.try_retrieve(b"k1").await.unwrap().unwrap();
        assert_eq!(hit.value, b"v1");
        assert_eq!(hit.correlation_id, "c1");

        store.remove(b"k1", "c2").await.unwrap();
        assert!(store.try_retrieve(b"k1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_value_and_correlation_id() {
        let store = MemoryStore::new();
        store.store(b"k", b"old", "c1").await.unwrap();
        store.store(b"k", b"new", "c2").await.unwrap();
        let hit = store.try_retrieve(b"k").await.unwrap().unwrap();
        assert_eq!(hit.value, b"new");
        assert_eq!(hit.correlation_id, "c2");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn remove_absent_key_is_noop() {
        let store = MemoryStore::new();
        store.remove(b"missing", "c").await.unwrap();
        store.remove(b"missing", "c").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn ledger_upsert_keeps_one_row_per_partition() {
        let store = MemoryStore::new();
        store
            .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 1, 4))
            .await
            .unwrap();
        store
            .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 0, 2))
            .await
            .unwrap();
        store
            .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 1, 9))
            .await
            .unwrap();

        let rows = store.last_consumed_offsets().await.unwrap();
        assert_eq!(
            rows,
            vec![
                TopicPartitionOffset::new("kv", 0, 2),
                TopicPartitionOffset::new("kv", 1, 9),
            ]
        );
    }
}
