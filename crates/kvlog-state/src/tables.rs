//! SQLite schema and statements for the SQLite state store.
//!
//! Two tables: the key-value rows themselves, and the consumed-offset ledger
//! with one row per `(topic, partition)`. Column names are quoted where they
//! collide with SQL keywords.

/// Key-value rows keyed by the raw key bytes.
pub const CREATE_KEY_VALUE_STORE: &str = "CREATE TABLE IF NOT EXISTS keyValueStore (
    kvKey BLOB PRIMARY KEY NOT NULL,
    kvValue BLOB NOT NULL,
    correlationId TEXT NOT NULL
)";

/// Consumed-offset ledger keyed by `(topic, partition)`.
pub const CREATE_TOPIC_PARTITION_OFFSETS: &str = "CREATE TABLE IF NOT EXISTS topicPartitionOffsets (
    topic TEXT NOT NULL,
    \"partition\" INTEGER NOT NULL,
    \"offset\" INTEGER NOT NULL,
    PRIMARY KEY (topic, \"partition\")
)";

pub const UPSERT_VALUE: &str = "INSERT INTO keyValueStore (kvKey, kvValue, correlationId)
    VALUES (?1, ?2, ?3)
    ON CONFLICT (kvKey) DO UPDATE SET kvValue = excluded.kvValue, correlationId = excluded.correlationId";

pub const SELECT_VALUE: &str =
    "SELECT kvValue, correlationId FROM keyValueStore WHERE kvKey = ?1";

pub const DELETE_VALUE: &str = "DELETE FROM keyValueStore WHERE kvKey = ?1";

pub const UPSERT_OFFSET: &str = "INSERT INTO topicPartitionOffsets (topic, \"partition\", \"offset\")
    VALUES (?1, ?2, ?3)
    ON CONFLICT (topic, \"partition\") DO UPDATE SET \"offset\" = excluded.\"offset\"";

pub const SELECT_OFFSETS: &str = "SELECT topic, \"partition\", \"offset\" FROM topicPartitionOffsets
    ORDER BY topic, \"partition\"";
