//! Sharded Document Storage
//!
//! This module implements the document store behind [`MemoryCluster`]. It is
//! a thread-safe map from document id to value, with a CAS value per
//! mutation and memcached-style expiry.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Keys are spread over 64 `RwLock`ed shards to reduce contention.
//! 2. **Lazy Expiry**: Expired documents are dropped when they are touched.
//! 3. **Active Expiry**: The background [`ExpirySweeper`] drops documents nobody touches.
//!
//! ## Expiry Encoding
//!
//! ```text
//!  expiry == 0                    never expires
//!  0 < expiry <= 30 days          seconds from now
//!  expiry >  30 days              absolute Unix timestamp
//! ```
//!
//! [`MemoryCluster`]: crate::transport::MemoryCluster
//! [`ExpirySweeper`]: crate::storage::ExpirySweeper

use crate::transport::StoreMode;
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// Expiry values above this many seconds are absolute Unix timestamps.
pub const RELATIVE_EXPIRY_LIMIT: u32 = 30 * 24 * 60 * 60;

/// Converts a wire expiry value into a deadline.
pub fn expiry_deadline(expiry: u32, now: Instant) -> Option<Instant> {
    if expiry == 0 {
        return None;
    }
    if expiry <= RELATIVE_EXPIRY_LIMIT {
        return Some(now + Duration::from_secs(u64::from(expiry)));
    }

    let unix_now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some(now + Duration::from_secs(u64::from(expiry).saturating_sub(unix_now)))
}

/// A stored document.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    /// Changes on every mutation
    pub cas: u64,
    /// None = never expires
    pub expires_at: Option<Instant>,
    pub stored_at: Instant,
}

impl Entry {
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }

    /// Remaining time to live in milliseconds, or None if no expiry.
    pub fn ttl_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()).as_millis() as u64)
    }
}

/// Why a conditional store was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key already exists")]
    KeyExists,
    #[error("key not found")]
    KeyNotFound,
}

/// Counters reported through the `stat` operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub items: u64,
    pub cmd_get: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub cmd_set: u64,
    pub delete_hits: u64,
    pub expired: u64,
}

#[derive(Debug)]
struct Shard {
    data: RwLock<HashMap<String, Entry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

/// The document store.
///
/// Wrap it in an `Arc` to share it between the transport and the sweeper.
///
/// # Example
///
/// ```
/// use couchlink::storage::StorageEngine;
/// use couchlink::transport::StoreMode;
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// let cas = engine.store("user:42", Bytes::from("{}"), 0, StoreMode::Upsert).unwrap();
/// assert_eq!(engine.get("user:42").unwrap().cas, cas);
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,
    key_count: AtomicU64,
    get_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
    last_cas: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("last_cas", &self.last_cas.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::new()).collect();

        Self {
            shards,
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            last_cas: AtomicU64::new(0),
        }
    }

    #[inline]
    fn get_shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Drops an expired entry that is still in the map.
    fn evict_expired(&self, data: &mut HashMap<String, Entry>, key: &str) {
        if data.remove(key).is_some() {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            self.expired_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stores a document.
    ///
    /// # Returns
    ///
    /// The new CAS value, or why the store was refused under `mode`.
    pub fn store(&self, key: &str, value: Bytes, expiry: u32, mode: StoreMode) -> Result<u64, StoreError> {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();

        let live = match data.get(key) {
            Some(entry) if entry.is_expired() => {
                self.evict_expired(&mut data, key);
                false
            }
            Some(_) => true,
            None => false,
        };

        match (mode, live) {
            (StoreMode::Insert, true) => return Err(StoreError::KeyExists),
            (StoreMode::Replace, false) => return Err(StoreError::KeyNotFound),
            _ => {}
        }

        let cas = self.last_cas.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        data.insert(
            key.to_string(),
            Entry {
                value,
                cas,
                expires_at: expiry_deadline(expiry, now),
                stored_at: now,
            },
        );

        if !live {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(cas)
    }

    /// Fetches a live document.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.get_shard(key);
        {
            let data = shard.data.read().unwrap();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => {
                    self.hit_count.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => {
                    self.miss_count.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: retake as writer to drop it
        let mut data = shard.data.write().unwrap();
        match data.get(key) {
            Some(entry) if !entry.is_expired() => {
                // Rewritten between the two locks
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            Some(_) => {
                self.evict_expired(&mut data, key);
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Removes a document. Returns `true` if a live document was removed.
    pub fn delete(&self, key: &str) -> bool {
        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();

        match data.remove(key) {
            Some(entry) => {
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                if entry.is_expired() {
                    self.expired_count.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    self.del_count.fetch_add(1, Ordering::Relaxed);
                    true
                }
            }
            None => false,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        let shard = self.get_shard(key);
        let data = shard.data.read().unwrap();
        data.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    /// Approximate number of stored documents (expired ones included until swept).
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            items: self.key_count.load(Ordering::Relaxed),
            cmd_get: self.get_count.load(Ordering::Relaxed),
            get_hits: self.hit_count.load(Ordering::Relaxed),
            get_misses: self.miss_count.load(Ordering::Relaxed),
            cmd_set: self.set_count.load(Ordering::Relaxed),
            delete_hits: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Total bytes held by live keys and values.
    pub fn memory_used(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| {
                let data = shard.data.read().unwrap();
                data.iter()
                    .map(|(key, entry)| (key.len() + entry.value.len()) as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    /// All live documents, ordered by key.
    pub fn snapshot(&self) -> Vec<(String, Bytes)> {
        let mut docs: Vec<(String, Bytes)> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let data = shard.data.read().unwrap();
                data.iter()
                    .filter(|(_, entry)| !entry.is_expired())
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        docs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        docs
    }

    /// Removes every document.
    pub fn flush(&self) {
        for shard in &self.shards {
            shard.data.write().unwrap().clear();
        }
        self.key_count.store(0, Ordering::Relaxed);
    }

    /// Drops expired documents from every shard.
    ///
    /// # Returns
    ///
    /// The number of documents removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.data.write().unwrap();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired());
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }
}
