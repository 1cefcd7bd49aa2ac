//! The backend-neutral state store contract.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kvlog_core::config::{StorageBackend, StorageConfig};
use kvlog_core::{StoredValue, TopicPartitionOffset};
use tracing::info;

use crate::disk::DiskStore;
use crate::error::StateResult;
use crate::memory::MemoryStore;
use crate::readiness::{PartitionProgress, ReadinessLatch};
use crate::sqlite::SqliteStore;

/// Local materialized view of a compacted key-value topic.
///
/// Keys and values are opaque byte strings compared by exact equality. The
/// materializer is the single writer; request handlers call
/// [`try_retrieve`](StateStore::try_retrieve) and [`ready`](StateStore::ready)
/// concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> StorageBackend;

    /// Upsert `key`. Overwrites both the value and the correlation id.
    async fn store(&self, key: &[u8], value: &[u8], correlation_id: &str) -> StateResult<()>;

    /// Exact-match lookup. A miss is `Ok(None)`.
    async fn try_retrieve(&self, key: &[u8]) -> StateResult<Option<StoredValue>>;

    /// Delete `key` if present. Removing an absent key is a no-op.
    async fn remove(&self, key: &[u8], correlation_id: &str) -> StateResult<()>;

    /// Every ledger row, ordered by topic then partition.
    async fn last_consumed_offsets(&self) -> StateResult<Vec<TopicPartitionOffset>>;

    /// Insert or replace the ledger row for `(topic, partition)`.
    async fn update_last_consumed_offset(&self, position: &TopicPartitionOffset)
    -> StateResult<()>;

    /// The readiness latch owned by this store.
    fn readiness(&self) -> &ReadinessLatch;

    /// Record the per-partition startup watermark.
    fn set_startup_watermark(&self, watermark: Vec<TopicPartitionOffset>) {
        self.readiness().set_watermark(watermark);
    }

    /// The recorded startup watermark, empty if none.
    fn startup_watermark(&self) -> Vec<TopicPartitionOffset> {
        self.readiness().watermark()
    }

    /// Whether the ledger has caught up with the startup watermark.
    ///
    /// Latches: once true, stays true without consulting the ledger again.
    async fn ready(&self) -> StateResult<bool> {
        if self.readiness().is_latched() {
            return Ok(true);
        }
        let ledger = self.last_consumed_offsets().await?;
        Ok(self.readiness().evaluate(&ledger))
    }

    /// Consumed-vs-target view of every watermark partition.
    async fn readiness_progress(&self) -> StateResult<Vec<PartitionProgress>> {
        let ledger = self.last_consumed_offsets().await?;
        Ok(self.readiness().progress(&ledger))
    }
}

/// Open the backend selected by `config`.
pub async fn open_store(config: &StorageConfig) -> StateResult<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackend::Dict => Arc::new(MemoryStore::new()),
        StorageBackend::Disk => {
            let root = config.location.clone().unwrap_or_else(|| PathBuf::from("."));
            Arc::new(DiskStore::open(root)?)
        }
        StorageBackend::Sqlite => match &config.location {
            Some(location) => {
                Arc::new(SqliteStore::open(location, config.sqlite_password.as_deref()).await?)
            }
            None => Arc::new(SqliteStore::open_in_memory().await?),
        },
    };
    info!(backend = ?store.backend(), "state store opened");
    Ok(store)
}

/// Sort ledger rows into the canonical topic-then-partition order.
pub(crate) fn sort_ledger(rows: &mut [TopicPartitionOffset]) {
    rows.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.partition.cmp(&b.partition)));
}
