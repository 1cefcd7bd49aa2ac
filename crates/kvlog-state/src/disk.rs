//! Filesystem backend.
//!
//! Layout under the storage root:
//!
//! ```text
//! {d[0..3]}/{d[3..6]}/{n}.key            raw key bytes
//! {d[0..3]}/{d[3..6]}/{n}.value          raw value bytes
//! {d[0..3]}/{d[3..6]}/{n}.correlationId  UTF-8 correlation id
//! topicPartitionOffsets/{digest(topic)}/{n}/topicName.txt
//! topicPartitionOffsets/{digest(topic)}/{n}/{partition}.partition
//! ```
//!
//! `d` is the [`key_digest`] of the key. A leaf directory holds one slot per
//! key sharing that digest; slots are matched by exact key bytes. All file
//! operations are serialized behind one lock.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kvlog_core::config::StorageBackend;
use kvlog_core::{StoredValue, TopicPartitionOffset, key_digest};
use tracing::{debug, error, warn};

use crate::error::{StateError, StateResult};
use crate::readiness::ReadinessLatch;
use crate::store::{StateStore, sort_ledger};

const LEDGER_DIR: &str = "topicPartitionOffsets";
const TOPIC_NAME_FILE: &str = "topicName.txt";
const KEY_EXT: &str = "key";
const VALUE_EXT: &str = "value";
const CORRELATION_EXT: &str = "correlationId";
const PARTITION_EXT: &str = "partition";

/// Content-addressed directory tree.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    lock: Mutex<()>,
    readiness: ReadinessLatch,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> StateResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(StateError::io(&root))?;
        debug!(root = %root.display(), "disk state store opened");
        Ok(Self {
            root,
            lock: Mutex::new(()),
            readiness: ReadinessLatch::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leaf_dir(&self, key: &[u8]) -> PathBuf {
        let digest = key_digest(key);
        self.root.join(&digest[0..3]).join(&digest[3..6])
    }

    // ── Slots ──────────────────────────────────────────────────────

    fn store_sync(&self, key: &[u8], value: &[u8], correlation_id: &str) -> StateResult<()> {
        let dir = self.leaf_dir(key);
        fs::create_dir_all(&dir).map_err(StateError::io(&dir))?;

        let slots = scan_slots(&dir)?;
        let slot = match find_slot(&dir, &slots, key)? {
            Some(slot) => slot,
            None => {
                let slot = lowest_free(&slots);
                // Key file last: a slot only becomes visible once complete.
                write(&slot_path(&dir, slot, VALUE_EXT), value)?;
                write(&slot_path(&dir, slot, CORRELATION_EXT), correlation_id.as_bytes())?;
                write(&slot_path(&dir, slot, KEY_EXT), key)?;
                debug!(dir = %dir.display(), slot, %correlation_id, "value stored in new slot");
                return Ok(());
            }
        };
        write(&slot_path(&dir, slot, VALUE_EXT), value)?;
        write(&slot_path(&dir, slot, CORRELATION_EXT), correlation_id.as_bytes())?;
        debug!(dir = %dir.display(), slot, %correlation_id, "value overwritten");
        Ok(())
    }

    fn retrieve_sync(&self, key: &[u8]) -> StateResult<Option<StoredValue>> {
        let dir = self.leaf_dir(key);
        if !dir.is_dir() {
            return Ok(None);
        }
        for slot in scan_slots(&dir)? {
            if read(&slot_path(&dir, slot, KEY_EXT))? != key {
                continue;
            }
            let value_path = slot_path(&dir, slot, VALUE_EXT);
            if !value_path.exists() {
                warn!(path = %value_path.display(), "matching key without value file");
                continue;
            }
            let value = read(&value_path)?;
            let correlation_path = slot_path(&dir, slot, CORRELATION_EXT);
            let correlation_id = if correlation_path.exists() {
                String::from_utf8_lossy(&read(&correlation_path)?).into_owned()
            } else {
                String::new()
            };
            return Ok(Some(StoredValue {
                value,
                correlation_id,
            }));
        }
        Ok(None)
    }

    fn remove_sync(&self, key: &[u8], correlation_id: &str) -> StateResult<()> {
        let dir = self.leaf_dir(key);
        if !dir.is_dir() {
            debug!(dir = %dir.display(), %correlation_id, "remove of absent key");
            return Ok(());
        }
        let slots = scan_slots(&dir)?;
        let Some(slot) = find_slot(&dir, &slots, key)? else {
            return Ok(());
        };

        for ext in [KEY_EXT, VALUE_EXT, CORRELATION_EXT] {
            let path = slot_path(&dir, slot, ext);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "slot file already missing on remove");
                }
                Err(e) => return Err(StateError::Io { path, source: e }),
            }
        }
        debug!(dir = %dir.display(), slot, %correlation_id, "value removed");
        prune_empty(&dir);
        Ok(())
    }

    // ── Ledger ─────────────────────────────────────────────────────

    fn ledger_sync(&self) -> StateResult<Vec<TopicPartitionOffset>> {
        let ledger_root = self.root.join(LEDGER_DIR);
        if !ledger_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for group in subdirs(&ledger_root)? {
            for topic_dir in subdirs(&group)? {
                let name_path = topic_dir.join(TOPIC_NAME_FILE);
                if !name_path.exists() {
                    warn!(dir = %topic_dir.display(), "ledger directory without topic name");
                    continue;
                }
                let topic = String::from_utf8_lossy(&read(&name_path)?).into_owned();
                for entry in fs::read_dir(&topic_dir).map_err(StateError::io(&topic_dir))? {
                    let path = entry.map_err(StateError::io(&topic_dir))?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXT) {
                        continue;
                    }
                    let partition = file_stem(&path)
                        .and_then(|stem| stem.parse::<i32>().ok())
                        .ok_or_else(|| StateError::Parse {
                            path: path.clone(),
                            reason: "partition file name is not an integer".to_string(),
                        })?;
                    let text = String::from_utf8_lossy(&read(&path)?).into_owned();
                    let offset = text.trim().parse::<i64>().map_err(|e| StateError::Parse {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    rows.push(TopicPartitionOffset::new(topic.clone(), partition, offset));
                }
            }
        }
        sort_ledger(&mut rows);
        Ok(rows)
    }

    fn update_ledger_sync(&self, position: &TopicPartitionOffset) -> StateResult<()> {
        let group = self
            .root
            .join(LEDGER_DIR)
            .join(key_digest(position.topic.as_bytes()));
        fs::create_dir_all(&group).map_err(StateError::io(&group))?;

        let mut next = 0u32;
        let mut topic_dir = None;
        for dir in subdirs(&group)? {
            if let Some(n) = file_name(&dir).and_then(|name| name.parse::<u32>().ok()) {
                next = next.max(n + 1);
            }
            let name_path = dir.join(TOPIC_NAME_FILE);
            if name_path.exists() && read(&name_path)? == position.topic.as_bytes() {
                topic_dir = Some(dir);
                break;
            }
        }
        let topic_dir = match topic_dir {
            Some(dir) => dir,
            None => {
                let dir = group.join(next.to_string());
                fs::create_dir_all(&dir).map_err(StateError::io(&dir))?;
                write(&dir.join(TOPIC_NAME_FILE), position.topic.as_bytes())?;
                dir
            }
        };

        let partition_path = topic_dir.join(format!("{}.{PARTITION_EXT}", position.partition));
        write(&partition_path, position.offset.to_string().as_bytes())
    }
}

#[async_trait]
impl StateStore for DiskStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Disk
    }

    async fn store(&self, key: &[u8], value: &[u8], correlation_id: &str) -> StateResult<()> {
        let _guard = self.guard();
        self.store_sync(key, value, correlation_id)
    }

    async fn try_retrieve(&self, key: &[u8]) -> StateResult<Option<StoredValue>> {
        let _guard = self.guard();
        self.retrieve_sync(key)
    }

    async fn remove(&self, key: &[u8], correlation_id: &str) -> StateResult<()> {
        let _guard = self.guard();
        self.remove_sync(key, correlation_id)
    }

    async fn last_consumed_offsets(&self) -> StateResult<Vec<TopicPartitionOffset>> {
        let _guard = self.guard();
        self.ledger_sync()
    }

    async fn update_last_consumed_offset(
        &self,
        position: &TopicPartitionOffset,
    ) -> StateResult<()> {
        let _guard = self.guard();
        self.update_ledger_sync(position)
    }

    fn readiness(&self) -> &ReadinessLatch {
        &self.readiness
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn slot_path(dir: &Path, slot: u32, ext: &str) -> PathBuf {
    dir.join(format!("{slot}.{ext}"))
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|s| s.to_str())
}

fn read(path: &Path) -> StateResult<Vec<u8>> {
    fs::read(path).map_err(StateError::io(path))
}

fn write(path: &Path, contents: &[u8]) -> StateResult<()> {
    fs::write(path, contents).map_err(StateError::io(path))
}

fn subdirs(dir: &Path) -> StateResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(StateError::io(dir))? {
        let path = entry.map_err(StateError::io(dir))?.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Slot numbers of every `{n}.key` file in `dir`, ascending.
///
/// A `.key` file whose stem is not a canonical non-negative integer means
/// the tree was modified outside this store; that is reported as corruption
/// rather than skipped.
fn scan_slots(dir: &Path) -> StateResult<BTreeSet<u32>> {
    let mut slots = BTreeSet::new();
    for entry in fs::read_dir(dir).map_err(StateError::io(dir))? {
        let path = entry.map_err(StateError::io(dir))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXT) {
            continue;
        }
        let slot = file_stem(&path)
            .and_then(|stem| stem.parse::<u32>().ok().filter(|n| n.to_string() == stem))
            .ok_or_else(|| StateError::Corrupt {
                path: path.clone(),
                reason: "key file name is not a slot number".to_string(),
            })?;
        slots.insert(slot);
    }
    Ok(slots)
}

fn find_slot(dir: &Path, slots: &BTreeSet<u32>, key: &[u8]) -> StateResult<Option<u32>> {
    for &slot in slots {
        if read(&slot_path(dir, slot, KEY_EXT))? == key {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// The smallest slot number not in use.
fn lowest_free(slots: &BTreeSet<u32>) -> u32 {
    let mut candidate = 0;
    for &slot in slots {
        if slot != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Remove `leaf` if empty, then its parent if that became empty too.
fn prune_empty(leaf: &Path) {
    let is_empty = |dir: &Path| {
        fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false)
    };
    if !is_empty(leaf) {
        return;
    }
    if let Err(e) = fs::remove_dir(leaf) {
        error!(dir = %leaf.display(), error = %e, "failed to prune empty key directory");
        return;
    }
    let Some(parent) = leaf.parent() else {
        return;
    };
    if is_empty(parent) {
        if let Err(e) = fs::remove_dir(parent) {
            error!(dir = %parent.display(), error = %e, "failed to prune empty key directory");
        }
    }
}
