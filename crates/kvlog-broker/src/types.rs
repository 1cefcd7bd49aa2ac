//! Records, topic specs and positions exchanged with the broker.

use std::collections::BTreeMap;

/// A record read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp_ms: i64,
}

impl LogRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A record to append to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Topic creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    /// `None` defers to the broker default.
    pub partitions: Option<i32>,
    /// `None` defers to the broker default.
    pub replication: Option<i32>,
    pub config: BTreeMap<String, String>,
}

impl TopicSpec {
    /// A compacted, infinitely retained key-value topic.
    pub fn compacted(name: impl Into<String>) -> Self {
        let config = [
            ("cleanup.policy", "compact"),
            ("retention.bytes", "-1"),
            ("retention.ms", "-1"),
            ("min.compaction.lag.ms", "900000"),
            ("max.compaction.lag.ms", "3600000"),
            ("segment.ms", "7200000"),
            ("delete.retention.ms", "86400000"),
            ("min.cleanable.dirty.ratio", "0.90"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            name: name.into(),
            partitions: None,
            replication: None,
            config,
        }
    }
}

/// Outcome of an idempotent topic creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCreation {
    Created,
    AlreadyExists,
}

/// Low and high log positions of one partition. `high` is one past the
/// last written offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

impl Watermarks {
    /// The last written offset, or 0 for an empty partition.
    pub fn last_written(&self) -> i64 {
        if self.high == 0 { 0 } else { self.high - 1 }
    }
}

/// Where consumption of a partition begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Beginning,
    At(i64),
}

/// One partition of a manual assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStart {
    pub partition: i32,
    pub start: StartOffset,
}
