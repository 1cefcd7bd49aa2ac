//! Fatal materialization errors. Any of these ends the consume loop.

use kvlog_broker::BrokerError;
use kvlog_core::CryptoError;
use kvlog_state::StateError;
use thiserror::Error;

pub type MaterializeResult<T> = Result<T, MaterializeError>;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("cannot decrypt {part} of record {topic}/{partition}@{offset}: {source}")]
    Decrypt {
        part: &'static str,
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: CryptoError,
    },

    #[error("{part} of record {topic}/{partition}@{offset} is shorter than its schema frame")]
    Frame {
        part: &'static str,
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("topic {0} has no partitions")]
    NoPartitions(String),
}
