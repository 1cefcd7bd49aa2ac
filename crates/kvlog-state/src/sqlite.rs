//! SQLite backend.
//!
//! A configured location selects an on-disk database, optionally keyed with
//! a password; no location selects one shared in-memory database that lives
//! as long as the store.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kvlog_core::config::StorageBackend;
use kvlog_core::{StoredValue, TopicPartitionOffset};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::readiness::ReadinessLatch;
use crate::store::StateStore;
use crate::tables::*;

/// File name used when the configured location is a directory.
pub const DEFAULT_FILE_NAME: &str = "kvlog.sqlite";

/// Embedded relational store.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    readiness: ReadinessLatch,
}

impl SqliteStore {
    /// Open (or create) the database at `location`.
    ///
    /// `location` may name a file, or a directory (existing, or written with
    /// a trailing separator) in which case [`DEFAULT_FILE_NAME`] is used
    /// inside it.
    pub async fn open(location: &Path, password: Option<&str>) -> StateResult<Self> {
        let path = resolve_db_path(location)?;
        let mut options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let password = password.filter(|p| !p.is_empty());
        if let Some(password) = password {
            options = options.pragma("key", Cow::<'static, str>::Owned(quote_pragma(password)));
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        if password.is_some() {
            ensure_cipher(&pool, &path).await?;
        }
        let store = Self::from_pool(pool).await?;
        debug!(path = %path.display(), encrypted = password.is_some(), "sqlite state store opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// The pool pins a single connection that is never recycled, so every
    /// caller sees the same database for the life of the store.
    pub async fn open_in_memory() -> StateResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::from_pool(pool).await?;
        debug!("in-memory sqlite state store opened");
        Ok(store)
    }

    async fn from_pool(pool: SqlitePool) -> StateResult<Self> {
        let store = Self {
            pool,
            readiness: ReadinessLatch::new(),
        };
        store.ensure_tables().await?;
        Ok(store)
    }

    /// Create both tables if they don't exist yet.
    async fn ensure_tables(&self) -> StateResult<()> {
        sqlx::query(CREATE_KEY_VALUE_STORE).execute(&self.pool).await?;
        sqlx::query(CREATE_TOPIC_PARTITION_OFFSETS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the pool, flushing the WAL for file-backed databases.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Sqlite
    }

    async fn store(&self, key: &[u8], value: &[u8], correlation_id: &str) -> StateResult<()> {
        sqlx::query(UPSERT_VALUE)
            .bind(key)
            .bind(value)
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        debug!(%correlation_id, "value stored");
        Ok(())
    }

    async fn try_retrieve(&self, key: &[u8]) -> StateResult<Option<StoredValue>> {
        let row = sqlx::query(SELECT_VALUE)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> StateResult<StoredValue> {
            Ok(StoredValue {
                value: r.try_get("kvValue")?,
                correlation_id: r.try_get("correlationId")?,
            })
        })
        .transpose()
    }

    async fn remove(&self, key: &[u8], correlation_id: &str) -> StateResult<()> {
        let result = sqlx::query(DELETE_VALUE)
            .bind(key)
            .execute(&self.pool)
            .await?;
        debug!(%correlation_id, rows = result.rows_affected(), "value removed");
        Ok(())
    }

    async fn last_consumed_offsets(&self) -> StateResult<Vec<TopicPartitionOffset>> {
        let rows = sqlx::query(SELECT_OFFSETS).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|r| -> StateResult<TopicPartitionOffset> {
                Ok(TopicPartitionOffset {
                    topic: r.try_get("topic")?,
                    partition: r.try_get("partition")?,
                    offset: r.try_get("offset")?,
                })
            })
            .collect()
    }

    async fn update_last_consumed_offset(
        &self,
        position: &TopicPartitionOffset,
    ) -> StateResult<()> {
        sqlx::query(UPSERT_OFFSET)
            .bind(&position.topic)
            .bind(position.partition)
            .bind(position.offset)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn readiness(&self) -> &ReadinessLatch {
        &self.readiness
    }
}

/// Map a configured location to the database file path, creating parent
/// directories as needed.
fn resolve_db_path(location: &Path) -> StateResult<PathBuf> {
    let names_dir = location
        .as_os_str()
        .to_str()
        .is_some_and(|s| s.ends_with('/') || s.ends_with(std::path::MAIN_SEPARATOR));
    let path = if names_dir || location.is_dir() {
        std::fs::create_dir_all(location).map_err(StateError::io(location))?;
        location.join(DEFAULT_FILE_NAME)
    } else {
        if let Some(parent) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StateError::io(parent))?;
        }
        location.to_path_buf()
    };
    Ok(path)
}

/// Fail unless the linked SQLite is SQLCipher. Plain SQLite accepts the
/// `key` pragma silently and writes plaintext.
async fn ensure_cipher(pool: &SqlitePool, path: &Path) -> StateResult<()> {
    let version: Option<String> = sqlx::query_scalar("PRAGMA cipher_version")
        .fetch_optional(pool)
        .await?;
    match version.filter(|v| !v.is_empty()) {
        Some(version) => {
            debug!(%version, "sqlcipher active");
            Ok(())
        }
        None => {
            pool.close().await;
            Err(StateError::EncryptionUnavailable {
                path: path.to_path_buf(),
            })
        }
    }
}

fn quote_pragma(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_value_and_correlation_id() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store(b"k", b"old", "c1").await.unwrap();
        store.store(b"k", b"new", "c2").await.unwrap();
        let hit = store.try_retrieve(b"k").await.unwrap().unwrap();
        assert_eq!(hit.value, b"new");
        assert_eq!(hit.correlation_id, "c2");
    }

    #[tokio::test]
    async fn in_memory_database_is_shared() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store(b"a", b"1", "c").await.unwrap();
        let (first, second) = tokio::join!(store.try_retrieve(b"a"), store.try_retrieve(b"a"));
        assert_eq!(first.unwrap().unwrap().value, b"1");
        assert_eq!(second.unwrap().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store(b"k", b"v", "c").await.unwrap();
        store.remove(b"k", "c").await.unwrap();
        store.remove(b"k", "c").await.unwrap();
        assert!(store.try_retrieve(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ledger_upsert_and_order() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for (partition, offset) in [(2, 1), (0, 5), (2, 9)] {
            store
                .update_last_consumed_offset(&TopicPartitionOffset::new("kv", partition, offset))
                .await
                .unwrap();
        }
        assert_eq!(
            store.last_consumed_offsets().await.unwrap(),
            vec![
                TopicPartitionOffset::new("kv", 0, 5),
                TopicPartitionOffset::new("kv", 2, 9),
            ]
        );
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("state");
        std::fs::create_dir_all(&dir).unwrap();

        let store = SqliteStore::open(&dir, None).await.unwrap();
        store.store(b"k", b"v", "c").await.unwrap();
        store.close().await;
        assert!(dir.join(DEFAULT_FILE_NAME).exists());

        let reopened = SqliteStore::open(&dir, None).await.unwrap();
        assert_eq!(reopened.try_retrieve(b"k").await.unwrap().unwrap().value, b"v");
    }

    const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[tokio::test]
    async fn password_encrypts_database_at_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db.sqlite");
        let secret = b"PLAINTEXT-SECRET-VALUE";

        let store = SqliteStore::open(&path, Some("hunter2")).await.unwrap();
        store.store(b"secret-key", secret, "c").await.unwrap();
        store.close().await;

        let mut bytes = std::fs::read(&path).unwrap();
        assert!(!bytes.starts_with(SQLITE_HEADER));
        let wal = tmp.path().join("db.sqlite-wal");
        if wal.exists() {
            bytes.extend(std::fs::read(&wal).unwrap());
        }
        assert!(!contains(&bytes, secret));
        assert!(!contains(&bytes, b"secret-key"));

        let reopened = SqliteStore::open(&path, Some("hunter2")).await.unwrap();
        assert_eq!(reopened.try_retrieve(b"secret-key").await.unwrap().unwrap().value, secret);
        reopened.close().await;

        assert!(SqliteStore::open(&path, Some("wrong")).await.is_err());
    }

    #[tokio::test]
    async fn empty_password_means_plain_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain.sqlite");
        let store = SqliteStore::open(&path, Some("")).await.unwrap();
        store.store(b"k", b"v", "c").await.unwrap();
        store.close().await;
        assert!(std::fs::read(&path).unwrap().starts_with(SQLITE_HEADER));
    }

    #[test]
    fn pragma_values_are_quoted() {
        assert_eq!(quote_pragma("secret"), "'secret'");
        assert_eq!(quote_pragma("it's"), "'it''s'");
    }
}
