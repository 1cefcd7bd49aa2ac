//! rdkafka-backed broker clients.
//!
//! All three clients are built from the passthrough property map
//! (`bootstrap.servers`, `security.protocol`, ...). librdkafka's blocking
//! calls run on the blocking thread pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::log::{LogAdmin, LogConsumer, LogProducer};
use crate::types::{
    LogRecord, OutgoingRecord, PartitionStart, StartOffset, TopicCreation, TopicSpec, Watermarks,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn client_config(properties: &BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

fn config_err(e: rdkafka::error::KafkaError) -> BrokerError {
    BrokerError::Config(e.to_string())
}

// ── Admin ──────────────────────────────────────────────────────────

pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
}

impl KafkaAdmin {
    pub fn new(properties: &BTreeMap<String, String>) -> BrokerResult<Self> {
        let client = client_config(properties).create().map_err(config_err)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl LogAdmin for KafkaAdmin {
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<TopicCreation> {
        let mut topic = NewTopic::new(
            &spec.name,
            spec.partitions.unwrap_or(-1),
            TopicReplication::Fixed(spec.replication.unwrap_or(-1)),
        );
        for (key, value) in &spec.config {
            topic = topic.set(key, value);
        }
        let results = self
            .client
            .create_topics([&topic], &AdminOptions::new())
            .await
            .map_err(|e| BrokerError::TopicCreation {
                topic: spec.name.clone(),
                reason: e.to_string(),
            })?;

        match results.into_iter().next() {
            Some(Ok(_)) => Ok(TopicCreation::Created),
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(TopicCreation::AlreadyExists),
            Some(Err((name, code))) => Err(BrokerError::TopicCreation {
                topic: name,
                reason: code.to_string(),
            }),
            None => Err(BrokerError::TopicCreation {
                topic: spec.name.clone(),
                reason: "broker returned no result".to_string(),
            }),
        }
    }

    async fn partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        let client = Arc::clone(&self.client);
        let name = topic.to_string();
        tokio::task::spawn_blocking(move || {
            let metadata = client
                .inner()
                .fetch_metadata(Some(&name), METADATA_TIMEOUT)
                .map_err(|e| BrokerError::Metadata(e.to_string()))?;
            let mut ids: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == name && t.error().is_none())
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            ids.sort_unstable();
            Ok(ids)
        })
        .await
        .map_err(|e| BrokerError::Metadata(e.to_string()))?
    }
}

// ── Consumer ───────────────────────────────────────────────────────

pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

impl KafkaConsumer {
    /// Offsets are tracked in the local ledger, so broker-side commits are
    /// disabled.
    pub fn new(properties: &BTreeMap<String, String>) -> BrokerResult<Self> {
        let mut config = client_config(properties);
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        if !properties.contains_key("group.id") {
            config.set("group.id", format!("kvlog-{}", std::process::id()));
        }
        let consumer: StreamConsumer = config.create().map_err(config_err)?;
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> LogRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();
    LogRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: message.payload().map(<[u8]>::to_vec),
        headers,
        timestamp_ms: message.timestamp().to_millis().unwrap_or_default(),
    }
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> BrokerResult<Watermarks> {
        let consumer = Arc::clone(&self.consumer);
        let name = topic.to_string();
        let (low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&name, partition, timeout)
        })
        .await
        .map_err(|e| BrokerError::Watermarks {
            topic: topic.to_string(),
            partition,
            reason: e.to_string(),
        })?
        .map_err(|e| BrokerError::Watermarks {
            topic: topic.to_string(),
            partition,
            reason: e.to_string(),
        })?;
        Ok(Watermarks { low, high })
    }

    async fn assign(&mut self, topic: &str, partitions: &[PartitionStart]) -> BrokerResult<()> {
        let mut list = TopicPartitionList::new();
        for start in partitions {
            let offset = match start.start {
                StartOffset::Beginning => Offset::Beginning,
                StartOffset::At(offset) => Offset::Offset(offset),
            };
            list.add_partition_offset(topic, start.partition, offset)
                .map_err(|e| BrokerError::Assign(e.to_string()))?;
        }
        self.consumer
            .assign(&list)
            .map_err(|e| BrokerError::Assign(e.to_string()))
    }

    async fn poll(&mut self, timeout: Duration) -> BrokerResult<Option<LogRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_record(&message))),
            Ok(Err(e)) => Err(BrokerError::Consume(e.to_string())),
        }
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.consumer
            .unassign()
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }
}

// ── Producer ───────────────────────────────────────────────────────

pub struct KafkaProducer {
    producer: ThreadedProducer<DefaultProducerContext>,
}

impl KafkaProducer {
    pub fn new(properties: &BTreeMap<String, String>) -> BrokerResult<Self> {
        let producer = client_config(properties).create().map_err(config_err)?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn send(&self, topic: &str, record: OutgoingRecord) -> BrokerResult<()> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_slice()),
            });
        }
        let mut base = BaseRecord::<[u8], [u8]>::to(topic)
            .key(record.key.as_slice())
            .headers(headers);
        if let Some(value) = record.value.as_deref() {
            base = base.payload(value);
        }
        self.producer
            .send(base)
            .map_err(|(e, _)| BrokerError::Send(e.to_string()))?;
        debug!(%topic, "record queued for delivery");
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> BrokerResult<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}
