//! Error types for broker operations.

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic creation failed for {topic}: {reason}")]
    TopicCreation { topic: String, reason: String },

    #[error("metadata query failed: {0}")]
    Metadata(String),

    #[error("watermark query failed for {topic}/{partition}: {reason}")]
    Watermarks {
        topic: String,
        partition: i32,
        reason: String,
    },

    #[error("assignment failed: {0}")]
    Assign(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("flush failed: {0}")]
    Flush(String),

    #[error("client configuration error: {0}")]
    Config(String),

    #[error("schema registry error: {0}")]
    SchemaRegistry(String),

    #[error("consumer is closed")]
    Closed,
}
