//! The consume loop and its phases.

use std::sync::Arc;
use std::time::Duration;

use kvlog_broker::{LogAdmin, LogConsumer, LogRecord, SchemaRegistry, detect_framing, ensure_topic};
use kvlog_core::config::ConsumerConfig;
use kvlog_core::{Envelope, TopicPartitionOffset};
use kvlog_state::StateStore;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::assignment::resolve_start_positions;
use crate::decode::RecordDecoder;
use crate::error::{MaterializeError, MaterializeResult};

/// Pause between partition metadata queries while a topic propagates.
const PARTITION_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of a [`Materializer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    CapturingWatermark,
    Subscribing,
    Consuming,
    Closing,
    /// The consumer has been released; `run` has returned or is returning.
    Stopped,
}

/// Timing knobs for the consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializerOptions {
    pub poll_timeout: Duration,
    /// Pause after reaching the end of the log.
    pub tail_backoff: Duration,
    pub watermark_timeout: Duration,
}

impl Default for MaterializerOptions {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

impl From<&ConsumerConfig> for MaterializerOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            tail_backoff: Duration::from_millis(config.tail_backoff_ms),
            watermark_timeout: Duration::from_millis(config.watermark_timeout_ms),
        }
    }
}

/// Single-writer replay of one topic into one store.
pub struct Materializer {
    topic: String,
    store: Arc<dyn StateStore>,
    admin: Arc<dyn LogAdmin>,
    consumer: Box<dyn LogConsumer>,
    envelope: Envelope,
    registry: Option<Arc<dyn SchemaRegistry>>,
    options: MaterializerOptions,
    phase: watch::Sender<Phase>,
}

impl Materializer {
    pub fn new(
        topic: impl Into<String>,
        store: Arc<dyn StateStore>,
        admin: Arc<dyn LogAdmin>,
        consumer: Box<dyn LogConsumer>,
        envelope: Envelope,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            topic: topic.into(),
            store,
            admin,
            consumer,
            envelope,
            registry: None,
            options: MaterializerOptions::default(),
            phase,
        }
    }

    /// Detect schema framing through `registry` at startup.
    pub fn with_schema_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_options(mut self, options: MaterializerOptions) -> Self {
        self.options = options;
        self
    }

    /// Watch phase transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        info!(topic = %self.topic, ?phase, "materializer phase");
        self.phase.send_replace(phase);
    }

    /// Materialize until `shutdown` flips to `true` (or its sender is
    /// dropped). Returns the fatal error, if any, after releasing the
    /// consumer.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> MaterializeResult<()> {
        let result = self.materialize(&mut shutdown).await;

        self.enter(Phase::Closing);
        if let Err(e) = &result {
            error!(topic = %self.topic, error = %e, "materializer failed, stopping consumption");
        }
        if let Err(e) = self.consumer.close().await {
            warn!(topic = %self.topic, error = %e, "consumer close failed");
        }
        self.enter(Phase::Stopped);
        result
    }

    async fn materialize(&mut self, shutdown: &mut watch::Receiver<bool>) -> MaterializeResult<()> {
        self.enter(Phase::Starting);
        ensure_topic(self.admin.as_ref(), &self.topic).await;
        let framing = detect_framing(self.registry.as_deref(), &self.topic).await;
        let decoder = RecordDecoder::new(self.envelope.clone(), framing);

        self.enter(Phase::CapturingWatermark);
        let partitions = self.discover_partitions().await?;
        self.capture_watermark(&partitions).await?;

        self.enter(Phase::Subscribing);
        let ledger = self.store.last_consumed_offsets().await?;
        let starts = resolve_start_positions(&self.topic, &partitions, &ledger);
        self.consumer.assign(&self.topic, &starts).await?;

        self.enter(Phase::Consuming);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let polled = tokio::select! {
                polled = self.consumer.poll(self.options.poll_timeout) => polled?,
                _ = shutdown.changed() => return Ok(()),
            };
            match polled {
                Some(record) => self.apply(&decoder, &record).await?,
                None => {
                    debug!(topic = %self.topic, "reached the end of the log");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.tail_backoff) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
        }
    }

    /// Partition ids of the topic. A freshly created topic may not show up
    /// in broker metadata at once, so an empty answer is retried until
    /// `watermark_timeout` has passed.
    async fn discover_partitions(&self) -> MaterializeResult<Vec<i32>> {
        let deadline = tokio::time::Instant::now() + self.options.watermark_timeout;
        loop {
            let partitions = self.admin.partitions(&self.topic).await?;
            if !partitions.is_empty() {
                return Ok(partitions);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MaterializeError::NoPartitions(self.topic.clone()));
            }
            debug!(topic = %self.topic, "no partitions in metadata yet, retrying");
            tokio::time::sleep(PARTITION_RETRY_INTERVAL).await;
        }
    }

    /// Record `high - 1` per partition as the readiness target and seed
    /// the ledger with the low watermark where it has no row yet.
    async fn capture_watermark(&self, partitions: &[i32]) -> MaterializeResult<()> {
        let ledger = self.store.last_consumed_offsets().await?;
        let mut watermark = Vec::with_capacity(partitions.len());
        for &partition in partitions {
            let marks = self
                .consumer
                .watermarks(&self.topic, partition, self.options.watermark_timeout)
                .await?;
            debug!(topic = %self.topic, partition, low = marks.low, high = marks.high, "watermarks");
            watermark.push(TopicPartitionOffset::new(
                self.topic.clone(),
                partition,
                marks.last_written(),
            ));

            let seeded = TopicPartitionOffset::new(self.topic.clone(), partition, marks.low);
            if !ledger.iter().any(|row| row.same_partition(&seeded)) {
                self.store.update_last_consumed_offset(&seeded).await?;
            }
        }
        info!(topic = %self.topic, ?watermark, "startup watermark captured");
        self.store.set_startup_watermark(watermark);
        Ok(())
    }

    async fn apply(&self, decoder: &RecordDecoder, record: &LogRecord) -> MaterializeResult<()> {
        let decoded = decoder.decode(record)?;
        trace!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            timestamp_ms = record.timestamp_ms,
            correlation_id = %decoded.correlation_id,
            tombstone = decoded.value.is_none(),
            "applying record"
        );
        match &decoded.value {
            Some(value) => {
                self.store
                    .store(&decoded.key, value, &decoded.correlation_id)
                    .await?
            }
            None => self.store.remove(&decoded.key, &decoded.correlation_id).await?,
        }
        self.store
            .update_last_consumed_offset(&TopicPartitionOffset::new(
                record.topic.clone(),
                record.partition,
                record.offset,
            ))
            .await?;

        if !self.store.readiness().is_latched() {
            self.store.ready().await?;
        }
        Ok(())
    }
}
