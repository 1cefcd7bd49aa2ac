//! kvlog-materializer — replays the key-value topic into a [`StateStore`].
//!
//! One [`Materializer`] runs per process as a single background task. It
//! moves through [`Phase`]s: ensure the topic exists, capture the startup
//! watermark, assign every partition (resuming from the ledger when it
//! matches), then apply records one at a time until shutdown or a fatal
//! error.
//!
//! [`StateStore`]: kvlog_state::StateStore

pub mod assignment;
pub mod decode;
pub mod error;
pub mod materializer;

pub use assignment::resolve_start_positions;
pub use decode::{DecodedRecord, RecordDecoder};
pub use error::{MaterializeError, MaterializeResult};
pub use materializer::{Materializer, MaterializerOptions, Phase};
