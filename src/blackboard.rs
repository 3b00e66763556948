//! Shared blackboard: a versioned key/value store agents read and write.
//!
//! Writers of the same key are serialised through a per-key lock, so two
//! writes to one key never interleave while writes to different keys run
//! in parallel. Observers of a key are called inside that key's critical
//! section, which means they see versions strictly in order. An observer
//! must not write to the key it observes.
//!
//! With a persistence path configured, every mutation rewrites a JSON
//! snapshot of the whole board.

use crate::error::Result;
use crate::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

/// A stored value together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: Payload,
    /// Who wrote this version.
    pub author: String,
    pub timestamp: DateTime<Utc>,
    /// 1 for the first write of a key, +1 for each later write.
    pub version: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Payload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlackboardConfig {
    /// Snapshot file; persistence is off when `None`.
    pub persistence_path: Option<PathBuf>,
}

impl BlackboardConfig {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            persistence_path: Some(path.into()),
        }
    }
}

/// Handle returned by [`Blackboard::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlackboardStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub notifications_sent: u64,
    pub total_keys: usize,
    pub total_observers: usize,
}

type Observer = Arc<dyn Fn(&str, &MemoryEntry) + Send + Sync>;

pub struct Blackboard {
    config: BlackboardConfig,
    entries: RwLock<HashMap<String, MemoryEntry>>,
    /// Global lock table guarding creation and removal of per-key locks.
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes snapshot writes so the last one on disk is the newest.
    persist_lock: Mutex<()>,
    observers: RwLock<HashMap<String, Vec<(SubscriptionId, Observer)>>>,
    next_subscription: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    notifications_sent: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Blackboard {
    /// An in-memory blackboard without persistence.
    pub fn new() -> Self {
        Self::with_config(BlackboardConfig::default())
    }

    fn with_config(config: BlackboardConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            observers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
        }
    }

    /// Create a blackboard, loading the snapshot at the configured path if
    /// one exists. A snapshot that fails to load is logged and ignored.
    pub fn open(config: BlackboardConfig) -> Self {
        let board = Self::with_config(config);
        if let Some(path) = board.config.persistence_path.as_deref() {
            if path.exists() {
                match Self::load_snapshot(path) {
                    Ok(entries) => {
                        info!(path = %path.display(), keys = entries.len(), "blackboard snapshot loaded");
                        *board.entries_mut() = entries.into_iter().collect();
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "failed to load blackboard snapshot");
                    }
                }
            }
        }
        board
    }

    /// Read a snapshot file written by a persistent blackboard.
    pub fn load_snapshot(path: &Path) -> Result<BTreeMap<String, MemoryEntry>> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn entries(&self) -> RwLockReadGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.key_locks);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Write a value, returning the key's new version.
    pub fn write(&self, key: &str, value: Payload, author: &str) -> u64 {
        self.write_with_metadata(key, value, author, BTreeMap::new())
    }

    pub fn write_with_metadata(
        &self,
        key: &str,
        value: Payload,
        author: &str,
        metadata: BTreeMap<String, Payload>,
    ) -> u64 {
        let key_lock = self.key_lock(key);
        let _guard = lock(&key_lock);

        let entry = {
            let mut entries = self.entries_mut();
            let version = entries.get(key).map_or(1, |e| e.version + 1);
            let entry = MemoryEntry {
                value,
                author: author.to_string(),
                timestamp: Utc::now(),
                version,
                metadata,
            };
            entries.insert(key.to_string(), entry.clone());
            entry
        };
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key, author, version = entry.version, "blackboard write");

        self.notify(key, &entry);
        self.persist();
        entry.version
    }

    fn notify(&self, key: &str, entry: &MemoryEntry) {
        let observers: Vec<(SubscriptionId, Observer)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default();

        for (id, observer) in observers {
            match catch_unwind(AssertUnwindSafe(|| observer(key, entry))) {
                Ok(()) => {
                    self.notifications_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    error!(key, subscription = id.0, "blackboard observer panicked");
                }
            }
        }
    }

    pub fn read(&self, key: &str) -> Option<Payload> {
        self.read_entry(key).map(|e| e.value)
    }

    pub fn read_or(&self, key: &str, default: Payload) -> Payload {
        self.read(key).unwrap_or(default)
    }

    pub fn read_entry(&self, key: &str) -> Option<MemoryEntry> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.entries().get(key).cloned()
    }

    /// Call `callback` after every write to `key`.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &MemoryEntry) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(key, subscription = id.0, "blackboard subscription added");
        id
    }

    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = observers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(key);
        }
        removed
    }

    /// Remove a key along with its lock and observers.
    pub fn delete(&self, key: &str) -> bool {
        let key_lock = self.key_lock(key);
        let _guard = lock(&key_lock);

        let removed = {
            let mut locks = lock(&self.key_locks);
            let removed = self.entries_mut().remove(key).is_some();
            locks.remove(key);
            self.observers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key);
            removed
        };

        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            debug!(key, "blackboard delete");
            self.persist();
        }
        removed
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Entries last written by `author`, keyed by key.
    pub fn get_by_author(&self, author: &str) -> BTreeMap<String, MemoryEntry> {
        self.entries()
            .iter()
            .filter(|(_, e)| e.author == author)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// The `n` most recently written entries, newest first.
    pub fn get_recent(&self, n: usize) -> Vec<(String, MemoryEntry)> {
        let mut entries: Vec<(String, MemoryEntry)> = self
            .entries()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    /// Drop every entry and observer.
    pub fn clear(&self) {
        let mut locks = lock(&self.key_locks);
        self.entries_mut().clear();
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        locks.clear();
        drop(locks);
        info!("blackboard cleared");
        self.persist();
    }

    pub fn stats(&self) -> BlackboardStats {
        BlackboardStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            total_keys: self.len(),
            total_observers: self
                .observers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(Vec::len)
                .sum(),
        }
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.config.persistence_path.as_deref()
    }

    fn persist(&self) {
        let Some(path) = self.config.persistence_path.as_deref() else {
            return;
        };
        let _guard = lock(&self.persist_lock);
        if let Err(e) = self.save_snapshot(path) {
            error!(path = %path.display(), error = %e, "failed to save blackboard snapshot");
        }
    }

    fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<String, MemoryEntry> = self
            .entries()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write beside the target and rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blackboard")
            .field("keys", &self.len())
            .field("persistence_path", &self.config.persistence_path)
            .finish()
    }
}
