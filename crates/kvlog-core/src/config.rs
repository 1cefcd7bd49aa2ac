//! Service configuration.
//!
//! Settings come from an optional TOML file and are then overridden by the
//! process environment. Environment names follow the `KV_API_*` convention;
//! any other `KAFKA_*` variable is passed through to the broker client with
//! its name lowercased and `_` replaced by `.`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{CryptoEnvelope, Envelope};
use crate::error::ConfigError;

pub const ENV_TOPIC: &str = "KV_API_KAFKA_KEY_VALUE_TOPIC";
pub const ENV_STORAGE_TYPE: &str = "KV_API_STATE_STORAGE_TYPE";
pub const ENV_STORAGE_LOCATION: &str = "KV_API_STATE_STORAGE_DISK_LOCATION";
pub const ENV_SQLITE_PASSWORD: &str = "KV_API_STATE_STORAGE_SQLITE_PASSWORD";
pub const ENV_ENCRYPT: &str = "KV_API_ENCRYPT_DATA_ON_KAFKA";
pub const ENV_AES_KEY: &str = "KV_API_AES_KEY";
pub const ENV_AES_KEY_LOCATION: &str = "KV_API_AES_KEY_LOCATION";
pub const ENV_DISABLE_WRITE: &str = "KV_API_DISABLE_WRITE";
pub const ENV_DISABLE_READ: &str = "KV_API_DISABLE_READ";
pub const ENV_LISTEN: &str = "KV_API_LISTEN_ADDRESS";
pub const ENV_BROKER: &str = "KV_API_BROKER";
pub const ENV_SCHEMA_REGISTRY_URL: &str = "KAFKA_SCHEMA_REGISTRY_URL";
pub const ENV_SCHEMA_REGISTRY_TIMEOUT: &str = "KAFKA_SCHEMA_REGISTRY_REQUEST_TIMEOUT_MS";

const KAFKA_PREFIX: &str = "KAFKA_";
const SCHEMA_REGISTRY_PREFIX: &str = "KAFKA_SCHEMA_REGISTRY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// The compacted log topic holding the key-value events.
    pub topic: String,
    pub listen: SocketAddr,
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub broker: BrokerConfig,
    pub schema_registry: SchemaRegistryConfig,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            read_enabled: true,
            write_enabled: true,
            storage: StorageConfig::default(),
            encryption: EncryptionConfig::default(),
            broker: BrokerConfig::default(),
            schema_registry: SchemaRegistryConfig::default(),
            consumer: ConsumerConfig::default(),
            producer: ProducerConfig::default(),
        }
    }
}

/// Which local materialization engine to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory collision-bucket map. Rebuilt from the log on every start.
    Dict,
    /// Content-addressed directory tree.
    Disk,
    /// Embedded SQLite tables.
    #[default]
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dict" => Ok(StorageBackend::Dict),
            "disk" => Ok(StorageBackend::Disk),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(ConfigError::Invalid {
                name: ENV_STORAGE_TYPE,
                reason: format!("unknown backend {other:?}, expected one of dict, disk, sqlite"),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory (disk) or database file/directory (sqlite).
    pub location: Option<PathBuf>,
    pub sqlite_password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// 64 hex characters.
    pub key_hex: Option<String>,
    /// File holding the hex key; used when `key_hex` is unset.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process log, for development and tests.
    Memory,
    /// Apache Kafka via librdkafka.
    Kafka,
}

impl FromStr for BrokerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerKind::Memory),
            "kafka" => Ok(BrokerKind::Kafka),
            other => Err(ConfigError::Invalid {
                name: ENV_BROKER,
                reason: format!("unknown broker {other:?}, expected memory or kafka"),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: Option<BrokerKind>,
    /// Client properties passed through verbatim (`bootstrap.servers`, ...).
    pub properties: BTreeMap<String, String>,
}

impl BrokerConfig {
    /// The configured kind, or Kafka when bootstrap servers are given.
    pub fn effective_kind(&self) -> BrokerKind {
        match self.kind {
            Some(kind) => kind,
            None if self.properties.contains_key("bootstrap.servers") => BrokerKind::Kafka,
            None => BrokerKind::Memory,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaRegistryConfig {
    pub url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for SchemaRegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub poll_timeout_ms: u64,
    /// Pause after reaching the end of the log.
    pub tail_backoff_ms: u64,
    pub watermark_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1_000,
            tail_backoff_ms: 8_000,
            watermark_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub flush_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 10_000,
        }
    }
}

impl ServiceConfig {
    /// Load from an optional TOML file, apply the process environment, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Override settings from `(name, value)` pairs.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            match name.as_str() {
                ENV_TOPIC => self.topic = value.trim().to_string(),
                ENV_STORAGE_TYPE => match value.parse() {
                    Ok(backend) => self.storage.backend = backend,
                    Err(e) => {
                        warn!(error = %e, "falling back to the default storage backend");
                        self.storage.backend = StorageBackend::default();
                    }
                },
                ENV_STORAGE_LOCATION => {
                    if value.trim().is_empty() {
                        warn!(variable = ENV_STORAGE_LOCATION, "blank storage location ignored");
                        self.storage.location = None;
                    } else {
                        self.storage.location = Some(PathBuf::from(value.trim()));
                    }
                }
                ENV_SQLITE_PASSWORD => self.storage.sqlite_password = non_blank(value),
                ENV_ENCRYPT => self.encryption.enabled = is_true(&value),
                ENV_AES_KEY => self.encryption.key_hex = non_blank(value),
                ENV_AES_KEY_LOCATION => self.encryption.key_file = non_blank(value).map(PathBuf::from),
                ENV_DISABLE_WRITE => self.write_enabled = !is_true(&value),
                ENV_DISABLE_READ => self.read_enabled = !is_true(&value),
                ENV_LISTEN => {
                    self.listen = value.trim().parse().map_err(|e| ConfigError::Invalid {
                        name: ENV_LISTEN,
                        reason: format!("{e}"),
                    })?
                }
                ENV_BROKER => self.broker.kind = Some(value.parse()?),
                ENV_SCHEMA_REGISTRY_URL => self.schema_registry.url = non_blank(value),
                ENV_SCHEMA_REGISTRY_TIMEOUT => {
                    self.schema_registry.request_timeout_ms =
                        value.trim().parse().map_err(|e| ConfigError::Invalid {
                            name: ENV_SCHEMA_REGISTRY_TIMEOUT,
                            reason: format!("{e}"),
                        })?
                }
                other if other.starts_with(SCHEMA_REGISTRY_PREFIX) => {
                    info!(variable = other, "unsupported schema registry setting ignored");
                }
                other if other.starts_with(KAFKA_PREFIX) && !value.is_empty() => {
                    self.broker.properties.insert(broker_property_name(other), value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject configurations the process must not serve traffic with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_TOPIC));
        }
        if self.encryption.enabled {
            self.envelope()?;
        }
        Ok(())
    }

    /// Build the log envelope described by the encryption settings.
    pub fn envelope(&self) -> Result<Envelope, ConfigError> {
        if !self.encryption.enabled {
            return Ok(Envelope::Disabled);
        }
        let key_hex = match (&self.encryption.key_hex, &self.encryption.key_file) {
            (Some(key), _) => key.trim().to_string(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?
                .trim()
                .to_string(),
            (None, None) => return Err(ConfigError::Missing(ENV_AES_KEY)),
        };
        let envelope = CryptoEnvelope::from_hex(&key_hex).map_err(|e| ConfigError::Invalid {
            name: ENV_AES_KEY,
            reason: e.to_string(),
        })?;
        Ok(Envelope::Enabled(envelope))
    }
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() { None } else { Some(value) }
}

/// `KAFKA_BOOTSTRAP_SERVERS` → `bootstrap.servers`.
fn broker_property_name(variable: &str) -> String {
    variable[KAFKA_PREFIX.len()..]
        .to_ascii_lowercase()
        .replace('_', ".")
}
