//! kvlog-publisher — the write path onto the log.
//!
//! [`Publisher::publish`] seals key, value and headers with the configured
//! envelope and hands the record to the producer. Buffered records are
//! flushed by [`Publisher::shutdown`], or on drop if shutdown never ran.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kvlog_broker::{BrokerError, LogProducer, OutgoingRecord};
use kvlog_core::{CORRELATION_ID_HEADER, CryptoError, Envelope};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot encrypt record {correlation_id}: {source}")]
    Crypto {
        correlation_id: String,
        #[source]
        source: CryptoError,
    },

    #[error("broker rejected record {correlation_id}: {source}")]
    Broker {
        correlation_id: String,
        #[source]
        source: BrokerError,
    },

    #[error("publisher is shut down")]
    ShutDown,
}

pub struct Publisher {
    topic: String,
    producer: Arc<dyn LogProducer>,
    envelope: Envelope,
    flush_timeout: Duration,
    shut_down: AtomicBool,
}

impl Publisher {
    pub fn new(
        topic: impl Into<String>,
        producer: Arc<dyn LogProducer>,
        envelope: Envelope,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            producer,
            envelope,
            flush_timeout,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append an upsert (`Some(value)`) or tombstone (`None`) for `key`.
    ///
    /// A `Correlation-Id` header carrying `correlation_id` is added unless
    /// `headers` already has one. `Ok` means accepted for delivery.
    pub async fn publish(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        headers: &[(String, Vec<u8>)],
        correlation_id: &str,
    ) -> Result<(), PublishError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PublishError::ShutDown);
        }
        let record = self.seal(key, value, headers, correlation_id).map_err(|source| {
            error!(%correlation_id, error = %source, "failed to encrypt record");
            PublishError::Crypto {
                correlation_id: correlation_id.to_string(),
                source,
            }
        })?;

        match self.producer.send(&self.topic, record).await {
            Ok(()) => {
                debug!(topic = %self.topic, %correlation_id, tombstone = value.is_none(), "record published");
                Ok(())
            }
            Err(source) => {
                error!(topic = %self.topic, %correlation_id, error = %source, "failed to publish record");
                Err(PublishError::Broker {
                    correlation_id: correlation_id.to_string(),
                    source,
                })
            }
        }
    }

    fn seal(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        headers: &[(String, Vec<u8>)],
        correlation_id: &str,
    ) -> Result<OutgoingRecord, CryptoError> {
        let mut plain: Vec<(&str, &[u8])> = headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
            .collect();
        if !plain.iter().any(|(name, _)| *name == CORRELATION_ID_HEADER) {
            plain.push((CORRELATION_ID_HEADER, correlation_id.as_bytes()));
        }

        let headers = plain
            .into_iter()
            .map(|(name, value)| {
                Ok((
                    self.envelope.seal_header_name(name)?,
                    self.envelope.seal_header_value(value)?,
                ))
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        Ok(OutgoingRecord {
            key: self.envelope.seal(key)?,
            value: value.map(|v| self.envelope.seal(v)).transpose()?,
            headers,
        })
    }

    /// Flush buffered records and refuse further publishes. Only the first
    /// call flushes.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let producer = Arc::clone(&self.producer);
        let timeout = self.flush_timeout;
        let result = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::Flush(e.to_string()))
            .and_then(|flushed| flushed);
        match &result {
            Ok(()) => info!(topic = %self.topic, "publisher flushed on shutdown"),
            Err(e) => error!(topic = %self.topic, error = %e, "publisher flush failed"),
        }
        result
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(topic = %self.topic, "publisher dropped without shutdown, flushing");
        if let Err(e) = self.producer.flush(self.flush_timeout) {
            error!(topic = %self.topic, error = %e, "publisher flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use kvlog_broker::{BrokerResult, MemoryLog};
    use kvlog_core::CryptoEnvelope;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    /// Records sends and counts flushes.
    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<OutgoingRecord>>,
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl LogProducer for Recording {
        async fn send(&self, _topic: &str, record: OutgoingRecord) -> BrokerResult<()> {
            self.sent.lock().unwrap().push(record);
            Ok(())
        }

        fn flush(&self, _timeout: Duration) -> BrokerResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn publisher(log: &MemoryLog, envelope: Envelope) -> Publisher {
        Publisher::new("kv", Arc::new(log.clone()), envelope, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn adds_correlation_header_when_missing() {
        let log = MemoryLog::new(1);
        let publisher = publisher(&log, Envelope::Disabled);
        publisher.publish(b"k", Some(b"v"), &[], "c-1").await.unwrap();

        let records = log.records("kv", 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"k");
        assert_eq!(records[0].value.as_deref(), Some(&b"v"[..]));
        assert_eq!(
            records[0].headers,
            vec![(CORRELATION_ID_HEADER.to_string(), b"c-1".to_vec())]
        );
    }

    #[tokio::test]
    async fn keeps_caller_correlation_header() {
        let log = MemoryLog::new(1);
        let publisher = publisher(&log, Envelope::Disabled);
        let headers = vec![(CORRELATION_ID_HEADER.to_string(), b"from-body".to_vec())];
        publisher.publish(b"k", None, &headers, "ignored").await.unwrap();

        let records = log.records("kv", 0);
        assert!(records[0].is_tombstone());
        assert_eq!(records[0].headers, headers);
    }

    #[tokio::test]
    async fn encrypts_everything() {
        let envelope = Envelope::Enabled(CryptoEnvelope::from_hex(KEY).unwrap());
        let log = MemoryLog::new(1);
        let publisher = publisher(&log, envelope.clone());
        publisher.publish(b"key", Some(b"value"), &[], "c-1").await.unwrap();

        let record = &log.records("kv", 0)[0];
        assert_ne!(record.key, b"key");
        assert_eq!(envelope.open(&record.key).unwrap(), b"key");
        assert_eq!(envelope.open(record.value.as_ref().unwrap()).unwrap(), b"value");
        let (name, value) = &record.headers[0];
        assert_eq!(envelope.open_header_name(name).unwrap(), CORRELATION_ID_HEADER);
        assert_eq!(envelope.open_header_value(value).unwrap(), b"c-1");
    }

    #[tokio::test]
    async fn broker_failure_is_reported() {
        let log = MemoryLog::new(1);
        log.set_fail_sends(true);
        let publisher = publisher(&log, Envelope::Disabled);
        let err = publisher.publish(b"k", Some(b"v"), &[], "c-9").await.unwrap_err();
        assert!(matches!(err, PublishError::Broker { ref correlation_id, .. } if correlation_id == "c-9"));
    }

    #[tokio::test]
    async fn empty_value_cannot_be_encrypted() {
        let envelope = Envelope::Enabled(CryptoEnvelope::from_hex(KEY).unwrap());
        let log = MemoryLog::new(1);
        let publisher = publisher(&log, envelope);
        let err = publisher.publish(b"k", Some(b""), &[], "c").await.unwrap_err();
        assert!(matches!(err, PublishError::Crypto { .. }));
        assert!(log.records("kv", 0).is_empty());
    }

    #[tokio::test]
    async fn shutdown_flushes_once_and_refuses_publishes() {
        let recording = Arc::new(Recording::default());
        let publisher = Publisher::new(
            "kv",
            recording.clone(),
            Envelope::Disabled,
            Duration::from_secs(1),
        );
        publisher.shutdown().await.unwrap();
        publisher.shutdown().await.unwrap();
        assert_eq!(recording.flushes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            publisher.publish(b"k", Some(b"v"), &[], "c").await,
            Err(PublishError::ShutDown)
        ));
        drop(publisher);
        assert_eq!(recording.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_flushes_without_shutdown() {
        let recording = Arc::new(Recording::default());
        let publisher = Publisher::new(
            "kv",
            recording.clone(),
            Envelope::Disabled,
            Duration::from_secs(1),
        );
        publisher.publish(b"k", Some(b"v"), &[], "c").await.unwrap();
        drop(publisher);
        assert_eq!(recording.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(recording.sent.lock().unwrap().len(), 1);
    }
}
