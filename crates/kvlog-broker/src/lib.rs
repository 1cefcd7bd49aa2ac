//! kvlog-broker — the boundary between kvlog and the log broker.
//!
//! The materializer and publisher only see the traits in [`log`]:
//!
//! - [`LogAdmin`]: idempotent topic creation and partition enumeration
//! - [`LogConsumer`]: watermark queries, manual assignment, polling
//! - [`LogProducer`]: fire-and-forget sends plus an explicit flush
//!
//! [`MemoryLog`] implements all three in-process. The `kafka` feature adds
//! an rdkafka-backed implementation.

pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod log;
pub mod memory;
pub mod schema;
pub mod types;

pub use error::{BrokerError, BrokerResult};
pub use log::{LogAdmin, LogConsumer, LogProducer, ensure_topic};
pub use memory::{MemoryConsumer, MemoryLog};
pub use schema::{FRAME_LEN, Framing, HttpSchemaRegistry, SchemaRegistry, detect_framing, strip_frame};
pub use types::*;
