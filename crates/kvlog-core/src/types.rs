//! Data model shared across kvlog crates.

use serde::{Deserialize, Serialize};

/// Name of the log header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "Correlation-Id";

/// A consumed (or target) position on one partition of a topic.
///
/// `(topic, partition)` identifies a ledger row; there is at most one row per
/// pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl TopicPartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Whether `other` refers to the same ledger row.
    pub fn same_partition(&self, other: &TopicPartitionOffset) -> bool {
        self.topic == other.topic && self.partition == other.partition
    }
}

/// One live entry in a state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub correlation_id: String,
}

/// The result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub correlation_id: String,
}

impl From<KeyValueEntry> for StoredValue {
    fn from(entry: KeyValueEntry) -> Self {
        Self {
            value: entry.value,
            correlation_id: entry.correlation_id,
        }
    }
}

/// Opaque tracing token attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// A fresh hyphenated UUID v4.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_uuids() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(a.as_str().matches('-').count(), 4);
    }

    #[test]
    fn same_partition_ignores_offset() {
        let a = TopicPartitionOffset::new("kv", 0, 3);
        assert!(a.same_partition(&TopicPartitionOffset::new("kv", 0, 9)));
        assert!(!a.same_partition(&TopicPartitionOffset::new("kv", 1, 3)));
        assert!(!a.same_partition(&TopicPartitionOffset::new("other", 0, 3)));
    }
}
