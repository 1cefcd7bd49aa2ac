//! kvlog-core — shared building blocks for the kvlog service.
//!
//! - [`types`]: the data model shared by the store, materializer and publisher
//! - [`hash`]: the short key digest used for bucketing
//! - [`crypto`]: the AES-256-CBC envelope applied to everything on the log
//! - [`config`]: service configuration (TOML file + `KV_API_*` environment)

pub mod config;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

pub use config::ServiceConfig;
pub use crypto::{CryptoEnvelope, Envelope};
pub use error::{ConfigError, CryptoError};
pub use hash::key_digest;
pub use types::*;
