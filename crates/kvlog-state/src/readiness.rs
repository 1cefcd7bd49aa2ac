//! Startup readiness latch.
//!
//! At boot the materializer records, per partition, the last offset written
//! before the process started. The store is ready once its ledger has
//! reached that watermark on every partition. Readiness latches: once
//! reached it stays true for the life of the process, even if the ledger
//! later falls behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use kvlog_core::TopicPartitionOffset;
use tracing::info;

/// How far one partition has progressed towards its startup watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProgress {
    pub topic: String,
    pub partition: i32,
    /// `None` if the ledger has no row for this partition.
    pub consumed: Option<i64>,
    pub target: i64,
}

/// Startup watermark plus the one-way ready flag.
#[derive(Debug, Default)]
pub struct ReadinessLatch {
    watermark: RwLock<Option<Vec<TopicPartitionOffset>>>,
    latched: AtomicBool,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the startup watermark. Called once at boot.
    pub fn set_watermark(&self, watermark: Vec<TopicPartitionOffset>) {
        let mut guard = self.watermark.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(watermark);
    }

    /// The captured watermark, empty if none has been captured yet.
    pub fn watermark(&self) -> Vec<TopicPartitionOffset> {
        self.watermark
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Evaluate readiness against the current ledger, latching on success.
    pub fn evaluate(&self, ledger: &[TopicPartitionOffset]) -> bool {
        if self.is_latched() {
            return true;
        }
        let guard = self.watermark.read().unwrap_or_else(PoisonError::into_inner);
        let Some(watermark) = guard.as_ref() else {
            return false;
        };
        if watermark.is_empty() {
            return false;
        }

        let caught_up = watermark.iter().all(|target| {
            ledger
                .iter()
                .find(|consumed| consumed.same_partition(target))
                .is_some_and(|consumed| consumed.offset >= target.offset)
        });

        if caught_up && !self.latched.swap(true, Ordering::AcqRel) {
            info!(partitions = watermark.len(), "state caught up with startup watermark");
        }
        caught_up
    }

    /// Per-partition consumed-vs-target view, for diagnostics.
    pub fn progress(&self, ledger: &[TopicPartitionOffset]) -> Vec<PartitionProgress> {
        self.watermark()
            .into_iter()
            .map(|target| PartitionProgress {
                consumed: ledger
                    .iter()
                    .find(|consumed| consumed.same_partition(&target))
                    .map(|consumed| consumed.offset),
                topic: target.topic,
                partition: target.partition,
                target: target.offset,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpo(partition: i32, offset: i64) -> TopicPartitionOffset {
        TopicPartitionOffset::new("kv", partition, offset)
    }

    #[test]
    fn not_ready_without_watermark() {
        let latch = ReadinessLatch::new();
        assert!(!latch.evaluate(&[tpo(0, 100)]));
        assert!(latch.watermark().is_empty());
    }

    #[test]
    fn not_ready_with_empty_watermark() {
        let latch = ReadinessLatch::new();
        latch.set_watermark(Vec::new());
        assert!(!latch.evaluate(&[tpo(0, 100)]));
    }

    #[test]
    fn latches_once_caught_up() {
        let latch = ReadinessLatch::new();
        latch.set_watermark(vec![tpo(0, 5)]);

        assert!(!latch.evaluate(&[]));
        assert!(!latch.evaluate(&[tpo(0, 3)]));
        assert!(latch.evaluate(&[tpo(0, 5)]));
        assert!(latch.is_latched());
        // Regression after latching does not reset readiness.
        assert!(latch.evaluate(&[tpo(0, 2)]));
        assert!(latch.evaluate(&[]));
    }

    #[test]
    fn every_watermark_partition_must_catch_up() {
        let latch = ReadinessLatch::new();
        latch.set_watermark(vec![tpo(0, 5), tpo(1, 2)]);

        assert!(!latch.evaluate(&[tpo(0, 9)]));
        assert!(!latch.evaluate(&[tpo(0, 9), tpo(1, 1)]));
        assert!(latch.evaluate(&[tpo(0, 9), tpo(1, 2)]));
    }

    #[test]
    fn other_topics_do_not_count() {
        let latch = ReadinessLatch::new();
        latch.set_watermark(vec![tpo(0, 5)]);
        assert!(!latch.evaluate(&[TopicPartitionOffset::new("other", 0, 50)]));
    }

    #[test]
    fn progress_reports_missing_partitions() {
        let latch = ReadinessLatch::new();
        latch.set_watermark(vec![tpo(0, 5), tpo(1, 2)]);
        let progress = latch.progress(&[tpo(0, 3)]);
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].consumed, Some(3));
        assert_eq!(progress[0].target, 5);
        assert_eq!(progress[1].consumed, None);
    }
}
