//! In-process partitioned log.
//!
//! Topics live in a shared map; offsets start at 0 per partition and the
//! partition of a record is chosen by CRC32 of its key. Every append wakes
//! waiting consumers. Nothing is compacted, but a prefix of a partition can
//! be dropped with [`MemoryLog::truncate_before`] to simulate retention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::log::{LogAdmin, LogConsumer, LogProducer};
use crate::types::{
    LogRecord, OutgoingRecord, PartitionStart, StartOffset, TopicCreation, TopicSpec, Watermarks,
};

#[derive(Debug, Default)]
struct Partition {
    /// Offset of `records[0]`.
    low: i64,
    records: Vec<LogRecord>,
}

impl Partition {
    fn high(&self) -> i64 {
        self.low + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&LogRecord> {
        let index = usize::try_from(offset - self.low).ok()?;
        self.records.get(index)
    }
}

#[derive(Debug)]
struct Inner {
    default_partitions: i32,
    topics: Mutex<HashMap<String, Vec<Partition>>>,
    appended: Notify,
    fail_sends: AtomicBool,
}

/// Shared handle to an in-process log. Clones see the same topics.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryLog {
    /// A log whose topics get `default_partitions` partitions unless the
    /// topic spec says otherwise.
    pub fn new(default_partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_partitions: default_partitions.max(1),
                topics: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                fail_sends: AtomicBool::new(false),
            }),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<Partition>>> {
        self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new consumer over this log.
    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            log: self.clone(),
            topic: None,
            positions: Vec::new(),
            cursor: 0,
            closed: false,
        }
    }

    /// Make every subsequent send fail until switched back off.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Append a record and return its `(partition, offset)`.
    pub fn append(&self, topic: &str, record: OutgoingRecord) -> (i32, i64) {
        let (partition, offset) = {
            let mut topics = self.topics();
            let partitions = topics.entry(topic.to_string()).or_insert_with(|| {
                (0..self.inner.default_partitions)
                    .map(|_| Partition::default())
                    .collect()
            });
            let partition = partition_for(&record.key, partitions.len());
            let slot = &mut partitions[partition as usize];
            let offset = slot.high();
            slot.records.push(LogRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: record.key,
                value: record.value,
                headers: record.headers,
                timestamp_ms: now_ms(),
            });
            (partition, offset)
        };
        self.inner.appended.notify_waiters();
        (partition, offset)
    }

    /// Every retained record of one partition.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<LogRecord> {
        self.topics()
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|p| p.records.clone())
            .unwrap_or_default()
    }

    /// Drop every record below `offset` in one partition.
    pub fn truncate_before(&self, topic: &str, partition: i32, offset: i64) {
        let mut topics = self.topics();
        if let Some(p) = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
        {
            let drop = (offset - p.low).clamp(0, p.records.len() as i64) as usize;
            p.records.drain(..drop);
            p.low += drop as i64;
        }
    }

    fn watermarks_of(&self, topic: &str, partition: i32) -> BrokerResult<Watermarks> {
        let topics = self.topics();
        let p = topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .ok_or_else(|| BrokerError::Watermarks {
                topic: topic.to_string(),
                partition,
                reason: "unknown topic or partition".to_string(),
            })?;
        Ok(Watermarks {
            low: p.low,
            high: p.high(),
        })
    }
}

fn partition_for(key: &[u8], partitions: usize) -> i32 {
    (crc32fast::hash(key) % partitions as u32) as i32
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl LogAdmin for MemoryLog {
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<TopicCreation> {
        let mut topics = self.topics();
        if topics.contains_key(&spec.name) {
            return Ok(TopicCreation::AlreadyExists);
        }
        let count = spec
            .partitions
            .filter(|n| *n > 0)
            .unwrap_or(self.inner.default_partitions);
        topics.insert(
            spec.name.clone(),
            (0..count).map(|_| Partition::default()).collect(),
        );
        Ok(TopicCreation::Created)
    }

    async fn partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        Ok(self
            .topics()
            .get(topic)
            .map(|partitions| (0..partitions.len() as i32).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LogProducer for MemoryLog {
    async fn send(&self, topic: &str, record: OutgoingRecord) -> BrokerResult<()> {
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::Send("memory log rejecting sends".to_string()));
        }
        let (partition, offset) = self.append(topic, record);
        debug!(%topic, partition, offset, "record appended");
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> BrokerResult<()> {
        Ok(())
    }
}

/// Consumer over a [`MemoryLog`]. Assigned partitions are served round
/// robin, one record at a time.
#[derive(Debug)]
pub struct MemoryConsumer {
    log: MemoryLog,
    topic: Option<String>,
    /// `(partition, next offset)`.
    positions: Vec<(i32, i64)>,
    cursor: usize,
    closed: bool,
}

impl MemoryConsumer {
    fn next_ready(&mut self) -> Option<LogRecord> {
        let topic = self.topic.as_ref()?;
        let topics = self.log.topics();
        let partitions = topics.get(topic)?;
        let count = self.positions.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let (partition, next) = self.positions[index];
            let Some(p) = partitions.get(partition as usize) else {
                continue;
            };
            // Records below the low watermark are gone.
            let next = next.max(p.low);
            if let Some(record) = p.get(next) {
                let record = record.clone();
                self.positions[index].1 = next + 1;
                self.cursor = (index + 1) % count;
                return Some(record);
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        _timeout: Duration,
    ) -> BrokerResult<Watermarks> {
        self.log.watermarks_of(topic, partition)
    }

    async fn assign(&mut self, topic: &str, partitions: &[PartitionStart]) -> BrokerResult<()> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let mut positions = Vec::with_capacity(partitions.len());
        for start in partitions {
            let watermarks = self.log.watermarks_of(topic, start.partition).map_err(|e| {
                BrokerError::Assign(format!("partition {}: {e}", start.partition))
            })?;
            let next = match start.start {
                StartOffset::Beginning => watermarks.low,
                StartOffset::At(offset) => offset.max(watermarks.low),
            };
            positions.push((start.partition, next));
        }
        self.topic = Some(topic.to_string());
        self.positions = positions;
        self.cursor = 0;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> BrokerResult<Option<LogRecord>> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let log = self.log.clone();
        loop {
            // Register interest before checking so an append in between
            // is not missed.
            let appended = log.inner.appended.notified();
            if let Some(record) = self.next_ready() {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        self.topic = None;
        self.positions.clear();
        Ok(())
    }
}
