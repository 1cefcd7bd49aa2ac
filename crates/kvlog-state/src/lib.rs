//! kvlog-state — the local materialization of the key-value log.
//!
//! Three interchangeable backends implement [`StateStore`] with identical
//! observable semantics:
//!
//! | Backend | Type | Persistence |
//! |---|---|---|
//! | `dict` | [`MemoryStore`] | none, rebuilt from the log on start |
//! | `disk` | [`DiskStore`] | directory tree keyed by the key digest |
//! | `sqlite` | [`SqliteStore`] | SQLite file, or shared in-memory database |
//!
//! Each store also owns the consumed-offset ledger and the startup
//! watermark used for readiness. The materializer is the only writer;
//! request handlers only read.

pub mod disk;
pub mod error;
pub mod memory;
pub mod readiness;
pub mod sqlite;
pub mod store;
pub mod tables;

pub use disk::DiskStore;
pub use error::{StateError, StateResult};
pub use memory::MemoryStore;
pub use readiness::{PartitionProgress, ReadinessLatch};
pub use sqlite::SqliteStore;
pub use store::{StateStore, open_store};
