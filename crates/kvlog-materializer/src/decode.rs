//! Turning a raw log record back into a plaintext state mutation.

use kvlog_broker::{Framing, LogRecord, strip_frame};
use kvlog_core::{CORRELATION_ID_HEADER, Envelope};
use tracing::warn;

use crate::error::{MaterializeError, MaterializeResult};

/// A decoded upsert (`value: Some`) or tombstone (`value: None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Last `Correlation-Id` header, or empty.
    pub correlation_id: String,
}

/// Strips schema frames and opens the crypto envelope.
#[derive(Debug, Clone, Default)]
pub struct RecordDecoder {
    envelope: Envelope,
    framing: Framing,
}

impl RecordDecoder {
    pub fn new(envelope: Envelope, framing: Framing) -> Self {
        Self { envelope, framing }
    }

    pub fn decode(&self, record: &LogRecord) -> MaterializeResult<DecodedRecord> {
        let key = self.open_part("key", record, &record.key, self.framing.key)?;
        let value = record
            .value
            .as_deref()
            .map(|value| self.open_part("value", record, value, self.framing.value))
            .transpose()?;
        Ok(DecodedRecord {
            key,
            value,
            correlation_id: self.correlation_id(record),
        })
    }

    fn open_part(
        &self,
        part: &'static str,
        record: &LogRecord,
        payload: &[u8],
        framed: bool,
    ) -> MaterializeResult<Vec<u8>> {
        let payload = if framed {
            strip_frame(payload).ok_or_else(|| MaterializeError::Frame {
                part,
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            })?
        } else {
            payload
        };
        self.envelope
            .open(payload)
            .map_err(|source| MaterializeError::Decrypt {
                part,
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                source,
            })
    }

    /// Headers that fail to open are skipped; the correlation id only
    /// serves diagnostics.
    fn correlation_id(&self, record: &LogRecord) -> String {
        let mut found = None;
        for (name, value) in &record.headers {
            let opened = self
                .envelope
                .open_header_name(name)
                .and_then(|name| Ok((name, self.envelope.open_header_value(value)?)));
            match opened {
                Ok((name, value)) if name == CORRELATION_ID_HEADER => found = Some(value),
                Ok(_) => {}
                Err(e) => warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "skipping header that cannot be decrypted"
                ),
            }
        }
        found
            .map(|value| String::from_utf8_lossy(&value).into_owned())
            .unwrap_or_default()
    }
}
