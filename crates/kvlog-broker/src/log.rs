//! Broker-facing traits.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::BrokerResult;
use crate::types::{
    LogRecord, OutgoingRecord, PartitionStart, TopicCreation, TopicSpec, Watermarks,
};

/// Topic administration.
#[async_trait]
pub trait LogAdmin: Send + Sync {
    /// Create `spec.name`. An existing topic is `Ok(AlreadyExists)`.
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<TopicCreation>;

    /// Partition ids of `topic`, ascending. Empty for an unknown topic.
    async fn partitions(&self, topic: &str) -> BrokerResult<Vec<i32>>;
}

/// A single-owner consumer with manual partition assignment.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> BrokerResult<Watermarks>;

    /// Replace the current assignment.
    async fn assign(&mut self, topic: &str, partitions: &[PartitionStart]) -> BrokerResult<()>;

    /// Wait up to `timeout` for the next record. `Ok(None)` means the end of
    /// every assigned partition was reached.
    async fn poll(&mut self, timeout: Duration) -> BrokerResult<Option<LogRecord>>;

    /// Drop the assignment and release the session.
    async fn close(&mut self) -> BrokerResult<()>;
}

/// Appends records to a topic. Safe to call from many tasks at once.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Hand a record to the client for delivery. Success means accepted for
    /// send, not committed.
    async fn send(&self, topic: &str, record: OutgoingRecord) -> BrokerResult<()>;

    /// Block the calling thread until buffered records are delivered or
    /// `timeout` elapses. Synchronous so it can run from `Drop`.
    fn flush(&self, timeout: Duration) -> BrokerResult<()>;
}

/// Create the compacted key-value topic if it does not exist yet.
///
/// Creation errors are logged rather than returned: the partition query
/// that follows decides whether the topic is usable.
pub async fn ensure_topic(admin: &dyn LogAdmin, topic: &str) {
    match admin.create_topic(&TopicSpec::compacted(topic)).await {
        Ok(TopicCreation::Created) => info!(%topic, "topic created"),
        Ok(TopicCreation::AlreadyExists) => debug!(%topic, "topic already exists"),
        Err(e) => warn!(%topic, error = %e, "topic creation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLog;

    #[tokio::test]
    async fn ensure_topic_is_idempotent() {
        let log = MemoryLog::new(3);
        ensure_topic(&log, "kv").await;
        ensure_topic(&log, "kv").await;
        assert_eq!(log.partitions("kv").await.unwrap(), vec![0, 1, 2]);
    }
}
