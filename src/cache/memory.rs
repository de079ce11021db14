//! In-Process Memory Tier
//!
//! Sharded LRU bounded by total serialized bytes. Each shard keeps its entries
//! in an `IndexMap` in recency order (front = least recently used) under its
//! own lock, so operations on different keys rarely contend and no lock is
//! ever held across an await.
//!
//! Entry size is the length of the serialized `ValueEntry`. Entries carry an
//! optional deadline; expired entries are dropped lazily on read and
//! preferentially during eviction. A value larger than one shard's budget is
//! never stored.

use crate::cache::entry::InvalidationCallback;
use crate::cache::events::EvictionReason;
use crate::cache::key::CacheKey;
use crate::config::MemoryTierConfig;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Memory Entry
// =============================================================================

/// A value held in memory, both materialized and serialized
#[derive(Clone)]
pub struct MemoryEntry {
    /// Original key (used to evaluate invalidation rules)
    pub key: Arc<dyn CacheKey>,
    /// Materialized value
    pub value: Arc<dyn Any + Send + Sync>,
    /// Serialized `ValueEntry` served to companions
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    /// Rust type name of `value`
    pub type_name: &'static str,
    pub expires_at: Option<Instant>,
    pub on_invalidated: Option<InvalidationCallback>,
}

impl MemoryEntry {
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

impl std::fmt::Debug for MemoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEntry")
            .field("key", &self.key.storage_key())
            .field("created_at", &self.created_at)
            .field("type_name", &self.type_name)
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Entry that left the tier while another operation ran
#[derive(Debug, Clone)]
pub struct Evicted {
    pub storage_key: String,
    pub entry: MemoryEntry,
    pub reason: EvictionReason,
}

/// Result of [`MemoryTier::get`]
#[derive(Debug)]
pub enum MemoryLookup {
    Hit(MemoryEntry),
    /// The entry had expired and was dropped
    Expired(Evicted),
    Absent,
}

/// Result of [`MemoryTier::insert`] and [`MemoryTier::insert_if_newer`]
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// False when the value exceeded the per-shard budget or was outdated
    pub stored: bool,
    pub evicted: Vec<Evicted>,
    /// Entry kept in place of an older value
    pub newer: Option<MemoryEntry>,
}

// =============================================================================
// Shard
// =============================================================================

#[derive(Default)]
struct Shard {
    /// Entries in LRU order (front = oldest, back = newest)
    entries: IndexMap<String, MemoryEntry>,
    bytes: u64,
}

impl Shard {
    fn take(&mut self, storage_key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.shift_remove(storage_key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes());
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<(String, MemoryEntry)> {
        let (key, entry) = self.entries.shift_remove_index(0)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes());
        Some((key, entry))
    }

    fn purge_expired(&mut self, now: Instant, evicted: &mut Vec<Evicted>) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for storage_key in expired {
            if let Some(entry) = self.take(&storage_key) {
                evicted.push(Evicted {
                    storage_key,
                    entry,
                    reason: EvictionReason::Expired,
                });
            }
        }
    }
}

// =============================================================================
// Memory Tier
// =============================================================================

/// Byte-bounded, sharded LRU of cache entries
pub struct MemoryTier {
    shards: Box<[Mutex<Shard>]>,
    shard_budget: u64,
    default_ttl: Option<Duration>,
    entry_count: AtomicU64,
    bytes: AtomicU64,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::with_config(&MemoryTierConfig::default())
    }

    pub fn with_config(config: &MemoryTierConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            shard_budget: (config.capacity_bytes / shard_count as u64).max(1),
            default_ttl: config.default_ttl(),
            entry_count: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, storage_key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        storage_key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Deadline for an entry stored now with an optional TTL override
    pub fn deadline(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl)
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&self, storage_key: &str) -> MemoryLookup {
        let mut shard = self.shard(storage_key).lock();
        let Some(entry) = shard.take(storage_key) else {
            return MemoryLookup::Absent;
        };

        if entry.is_expired(Instant::now()) {
            drop(shard);
            self.account_removed(&entry);
            return MemoryLookup::Expired(Evicted {
                storage_key: storage_key.to_string(),
                entry,
                reason: EvictionReason::Expired,
            });
        }

        shard.bytes += entry.size_bytes();
        shard.entries.insert(storage_key.to_string(), entry.clone());
        MemoryLookup::Hit(entry)
    }

    /// Read an entry without touching recency or expiring it
    pub fn peek(&self, storage_key: &str) -> Option<MemoryEntry> {
        let shard = self.shard(storage_key).lock();
        shard
            .entries
            .get(storage_key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .cloned()
    }

    /// Store an entry, evicting expired then least recently used entries
    pub fn insert(&self, storage_key: String, entry: MemoryEntry) -> InsertOutcome {
        self.insert_with(storage_key, entry, false)
    }

    /// Like [`MemoryTier::insert`], but a live entry created after `entry`
    /// stays in place and is returned in [`InsertOutcome::newer`]
    pub fn insert_if_newer(&self, storage_key: String, entry: MemoryEntry) -> InsertOutcome {
        self.insert_with(storage_key, entry, true)
    }

    fn insert_with(&self, storage_key: String, entry: MemoryEntry, keep_newer: bool) -> InsertOutcome {
        let size = entry.size_bytes();
        let mut outcome = InsertOutcome::default();
        let mut shard = self.shard(&storage_key).lock();

        if keep_newer {
            let now = Instant::now();
            if let Some(existing) = shard.entries.get(&storage_key) {
                if existing.created_at > entry.created_at && !existing.is_expired(now) {
                    outcome.newer = Some(existing.clone());
                    return outcome;
                }
            }
        }

        let previous = shard.take(&storage_key);
        if let Some(previous) = &previous {
            self.account_removed(previous);
        }

        if size > self.shard_budget {
            drop(shard);
            if let Some(previous) = previous {
                outcome.evicted.push(Evicted {
                    storage_key: storage_key.clone(),
                    entry: previous,
                    reason: EvictionReason::Superseded,
                });
            }
            outcome.evicted.push(Evicted {
                storage_key,
                entry,
                reason: EvictionReason::Oversized,
            });
            return outcome;
        }

        if shard.bytes + size > self.shard_budget {
            shard.purge_expired(Instant::now(), &mut outcome.evicted);
        }
        while shard.bytes + size > self.shard_budget {
            match shard.pop_oldest() {
                Some((key, oldest)) => outcome.evicted.push(Evicted {
                    storage_key: key,
                    entry: oldest,
                    reason: EvictionReason::Capacity,
                }),
                None => break,
            }
        }

        shard.bytes += size;
        shard.entries.insert(storage_key, entry);
        drop(shard);

        for evicted in &outcome.evicted {
            self.account_removed(&evicted.entry);
        }
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        outcome.stored = true;
        outcome
    }

    /// Remove one entry
    pub fn remove(&self, storage_key: &str) -> Option<MemoryEntry> {
        let entry = self.shard(storage_key).lock().take(storage_key)?;
        self.account_removed(&entry);
        Some(entry)
    }

    /// Remove an entry only if `predicate` holds for it
    pub fn remove_if(
        &self,
        storage_key: &str,
        predicate: impl FnOnce(&MemoryEntry) -> bool,
    ) -> Option<MemoryEntry> {
        let mut shard = self.shard(storage_key).lock();
        if !shard.entries.get(storage_key).is_some_and(predicate) {
            return None;
        }
        let entry = shard.take(storage_key)?;
        drop(shard);
        self.account_removed(&entry);
        Some(entry)
    }

    /// Remove every entry matching `predicate`, one shard lock at a time
    pub fn remove_matching(
        &self,
        mut predicate: impl FnMut(&str, &MemoryEntry) -> bool,
    ) -> Vec<(String, MemoryEntry)> {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let matching: Vec<String> = shard
                .entries
                .iter()
                .filter(|(key, entry)| predicate(key, entry))
                .map(|(key, _)| key.clone())
                .collect();
            for storage_key in matching {
                if let Some(entry) = shard.take(&storage_key) {
                    removed.push((storage_key, entry));
                }
            }
        }
        for (_, entry) in &removed {
            self.account_removed(entry);
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.bytes = 0;
        }
        self.entry_count.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub fn contains(&self, storage_key: &str) -> bool {
        self.peek(storage_key).is_some()
    }

    pub fn len(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Largest value the tier will hold
    pub fn max_entry_bytes(&self) -> u64 {
        self.shard_budget
    }

    fn account_removed(&self, entry: &MemoryEntry) {
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(entry.size_bytes(), Ordering::Relaxed);
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}
