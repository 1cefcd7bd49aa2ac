//! Every backend must behave identically through the `StateStore` trait.

use std::collections::HashMap;
use std::sync::Arc;

use kvlog_core::config::{StorageBackend, StorageConfig};
use kvlog_core::{TopicPartitionOffset, key_digest};
use kvlog_state::{DiskStore, MemoryStore, SqliteStore, StateStore, open_store};
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    store: Arc<dyn StateStore>,
    _dir: Option<TempDir>,
}

async fn backends() -> Vec<Backend> {
    let dir = tempfile::tempdir().unwrap();
    let disk = DiskStore::open(dir.path()).unwrap();
    vec![
        Backend {
            name: "dict",
            store: Arc::new(MemoryStore::new()),
            _dir: None,
        },
        Backend {
            name: "disk",
            store: Arc::new(disk),
            _dir: Some(dir),
        },
        Backend {
            name: "sqlite",
            store: Arc::new(SqliteStore::open_in_memory().await.unwrap()),
            _dir: None,
        },
    ]
}

/// Two distinct 64-byte keys with the same digest.
fn colliding_keys() -> (Vec<u8>, Vec<u8>) {
    let mut seen: HashMap<String, Vec<u8>> = HashMap::new();
    for i in 0u64.. {
        let key = format!("{i:064}").into_bytes();
        let digest = key_digest(&key);
        if let Some(other) = seen.get(&digest) {
            return (other.clone(), key);
        }
        seen.insert(digest, key);
    }
    unreachable!()
}

#[tokio::test]
async fn store_then_retrieve_returns_value_and_correlation_id() {
    for b in backends().await {
        b.store.store(b"k1", b"v1", "corr-1").await.unwrap();
        let hit = b.store.try_retrieve(b"k1").await.unwrap().unwrap();
        assert_eq!(hit.value, b"v1", "{}", b.name);
        assert_eq!(hit.correlation_id, "corr-1", "{}", b.name);
        assert!(b.store.try_retrieve(b"k2").await.unwrap().is_none(), "{}", b.name);
    }
}

#[tokio::test]
async fn overwrite_keeps_last_write() {
    for b in backends().await {
        b.store.store(b"k", b"first", "c1").await.unwrap();
        b.store.store(b"k", b"second", "c2").await.unwrap();
        let hit = b.store.try_retrieve(b"k").await.unwrap().unwrap();
        assert_eq!(hit.value, b"second", "{}", b.name);
        assert_eq!(hit.correlation_id, "c2", "{}", b.name);
    }
}

#[tokio::test]
async fn remove_is_idempotent() {
    for b in backends().await {
        b.store.store(b"k", b"v", "c").await.unwrap();
        b.store.remove(b"k", "c").await.unwrap();
        assert!(b.store.try_retrieve(b"k").await.unwrap().is_none(), "{}", b.name);
        b.store.remove(b"k", "c").await.unwrap();
        b.store.remove(b"never", "c").await.unwrap();
        assert!(b.store.try_retrieve(b"k").await.unwrap().is_none(), "{}", b.name);
    }
}

#[tokio::test]
async fn colliding_keys_are_independent() {
    let (a, b_key) = colliding_keys();
    assert_ne!(a, b_key);
    assert_eq!(a.len(), 64);
    assert_eq!(key_digest(&a), key_digest(&b_key));

    for b in backends().await {
        b.store.store(&a, b"value-a", "ca").await.unwrap();
        b.store.store(&b_key, b"value-b", "cb").await.unwrap();

        assert_eq!(b.store.try_retrieve(&a).await.unwrap().unwrap().value, b"value-a", "{}", b.name);
        assert_eq!(b.store.try_retrieve(&b_key).await.unwrap().unwrap().value, b"value-b", "{}", b.name);

        b.store.remove(&a, "ca").await.unwrap();
        assert!(b.store.try_retrieve(&a).await.unwrap().is_none(), "{}", b.name);
        let survivor = b.store.try_retrieve(&b_key).await.unwrap().unwrap();
        assert_eq!(survivor.value, b"value-b", "{}", b.name);
        assert_eq!(survivor.correlation_id, "cb", "{}", b.name);

        // The freed slot is reused without disturbing the other key.
        b.store.store(&a, b"value-a2", "ca2").await.unwrap();
        assert_eq!(b.store.try_retrieve(&a).await.unwrap().unwrap().value, b"value-a2", "{}", b.name);
        assert_eq!(b.store.try_retrieve(&b_key).await.unwrap().unwrap().value, b"value-b", "{}", b.name);
    }
}

#[tokio::test]
async fn binary_keys_and_values_round_trip() {
    let key: Vec<u8> = (0..=255u8).collect();
    let value: Vec<u8> = (0..=255u8).rev().cycle().take(1024).collect();
    for b in backends().await {
        b.store.store(&key, &value, "bin").await.unwrap();
        assert_eq!(b.store.try_retrieve(&key).await.unwrap().unwrap().value, value, "{}", b.name);
    }
}

#[tokio::test]
async fn readiness_latches_across_ledger_regression() {
    for b in backends().await {
        assert!(!b.store.ready().await.unwrap(), "{}", b.name);
        b.store
            .set_startup_watermark(vec![TopicPartitionOffset::new("kv", 0, 5)]);
        assert_eq!(b.store.startup_watermark().len(), 1);
        assert!(!b.store.ready().await.unwrap(), "{}", b.name);

        b.store
            .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 0, 3))
            .await
            .unwrap();
        assert!(!b.store.ready().await.unwrap(), "{}", b.name);

        b.store
            .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 0, 5))
            .await
            .unwrap();
        assert!(b.store.ready().await.unwrap(), "{}", b.name);

        b.store
            .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 0, 2))
            .await
            .unwrap();
        assert!(b.store.ready().await.unwrap(), "{}", b.name);
    }
}

#[tokio::test]
async fn ledger_has_one_row_per_partition() {
    for b in backends().await {
        for (topic, partition, offset) in [("kv", 1, 3), ("kv", 0, 1), ("kv", 1, 4), ("other", 0, 0)] {
            b.store
                .update_last_consumed_offset(&TopicPartitionOffset::new(topic, partition, offset))
                .await
                .unwrap();
        }
        assert_eq!(
            b.store.last_consumed_offsets().await.unwrap(),
            vec![
                TopicPartitionOffset::new("kv", 0, 1),
                TopicPartitionOffset::new("kv", 1, 4),
                TopicPartitionOffset::new("other", 0, 0),
            ],
            "{}",
            b.name
        );
    }
}

#[tokio::test]
async fn persistent_backends_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    for backend in [StorageBackend::Disk, StorageBackend::Sqlite] {
        let config = StorageConfig {
            backend,
            location: Some(tmp.path().join(format!("{backend:?}/"))),
            sqlite_password: None,
        };
        {
            let store = open_store(&config).await.unwrap();
            store.store(b"k", b"v", "c").await.unwrap();
            store
                .update_last_consumed_offset(&TopicPartitionOffset::new("kv", 0, 42))
                .await
                .unwrap();
        }
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.try_retrieve(b"k").await.unwrap().unwrap().value, b"v", "{backend:?}");
        assert_eq!(
            store.last_consumed_offsets().await.unwrap(),
            vec![TopicPartitionOffset::new("kv", 0, 42)]
        );
        // Readiness is process-local and starts over.
        assert!(!store.ready().await.unwrap());
    }
}
