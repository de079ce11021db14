//! Passive Cache Locations
//!
//! A passive location is a shared store (e.g. Redis) that holds serialized
//! entries but never pushes notifications. Stored keys are the configured
//! prefix followed by the canonical key; stored values are tagged, optionally
//! compressed `ValueEntry` JSON.

use super::{CacheLocation, InvalidReason, LocationId, LocationKind, LocationLookup};
use crate::cache::compression::PayloadCodec;
use crate::cache::key::KeyHolder;
use crate::config::{PassiveBackend, PassiveStoreConfig};
use crate::error::Result;
use crate::location::redis::{RedisStore, RedisStoreConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// PassiveStore Trait
// =============================================================================

/// Raw byte store behind a passive location
#[async_trait]
pub trait PassiveStore: Send + Sync {
    /// Store name, used as the location id
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Returns true if the key existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Process-local [`PassiveStore`] for tests and standalone nodes
///
/// Clones share the same underlying map, so several engines in one process
/// can be pointed at the same "shared" store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    name: String,
    entries: Arc<RwLock<HashMap<String, StoredValue>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|v| !v.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|v| !v.is_expired(now))
    }
}

impl InMemoryStore {
    /// Drop `key` if it is still expired; a value set since the read stays
    fn remove_expired(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|stored| stored.is_expired(now)) {
            entries.remove(key);
            return true;
        }
        false
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PassiveStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(stored) if !stored.is_expired(now) => return Ok(Some(stored.value.clone())),
                Some(_) => {}
            }
        }
        self.remove_expired(key, now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let stored = StoredValue {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().insert(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

// =============================================================================
// Passive Cache Location
// =============================================================================

/// A [`PassiveStore`] exposed as a cache location
pub struct PassiveCacheLocation {
    id: LocationId,
    store: Arc<dyn PassiveStore>,
    key_prefix: String,
    codec: PayloadCodec,
    ttl: Option<Duration>,
}

impl PassiveCacheLocation {
    pub fn new(store: Arc<dyn PassiveStore>, config: &PassiveStoreConfig) -> Self {
        Self {
            id: LocationId::new(store.name()),
            key_prefix: config.key_prefix.clone(),
            codec: PayloadCodec::new(config.compression.clone()),
            ttl: config.ttl(),
            store,
        }
    }

    /// Full store key for a canonical key
    pub fn store_key(&self, storage_key: &str) -> String {
        format!("{}{}", self.key_prefix, storage_key)
    }

    /// Write a serialized `ValueEntry`
    pub async fn write(&self, key: &KeyHolder, entry: &[u8], ttl: Option<Duration>) -> Result<()> {
        let stored = self.codec.encode(entry);
        let store_key = self.store_key(key.storage_key());
        debug!(key = %key, location = %self.id, size_bytes = stored.len(), "Writing passive entry");
        self.store.set(&store_key, stored, ttl.or(self.ttl)).await
    }

    /// Delete a key; returns true if it existed
    pub async fn delete(&self, key: &KeyHolder) -> Result<bool> {
        self.store.delete(&self.store_key(key.storage_key())).await
    }

    pub fn store(&self) -> &Arc<dyn PassiveStore> {
        &self.store
    }
}

#[async_trait]
impl CacheLocation for PassiveCacheLocation {
    fn id(&self) -> &LocationId {
        &self.id
    }

    fn kind(&self) -> LocationKind {
        LocationKind::Passive
    }

    async fn get(
        &self,
        key: &KeyHolder,
        minimum_creation_date: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> LocationLookup {
        let started = Instant::now();
        let store_key = self.store_key(key.storage_key());

        let fetched = tokio::select! {
            fetched = self.store.get(&store_key) => fetched,
            _ = cancel.cancelled() => return LocationLookup::Miss,
        };

        let stored = match fetched {
            Ok(Some(stored)) => stored,
            Ok(None) => return LocationLookup::Miss,
            Err(e) => {
                warn!(key = %key, location = %self.id, error = %e, "Passive store read failed");
                return LocationLookup::Miss;
            }
        };

        let payload = match self.codec.decode(&stored) {
            Ok(payload) => payload,
            Err(e) => {
                return LocationLookup::Invalid(InvalidReason::Suspicious(format!(
                    "undecodable passive payload: {}",
                    e
                )))
            }
        };

        LocationLookup::from_payload(
            payload,
            minimum_creation_date,
            &self.id,
            LocationKind::Passive,
            started.elapsed(),
        )
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Build the passive locations described by the configuration
pub async fn build_passive_locations(config: &PassiveStoreConfig) -> Result<Vec<Arc<PassiveCacheLocation>>> {
    let store: Arc<dyn PassiveStore> = match &config.backend {
        PassiveBackend::None => return Ok(Vec::new()),
        PassiveBackend::InMemory => Arc::new(InMemoryStore::new()),
        PassiveBackend::Redis { url } => {
            let redis_config = RedisStoreConfig::new(url.clone())
                .with_connection_timeout(Duration::from_secs(config.connect_timeout_secs));
            Arc::new(RedisStore::connect(redis_config).await?)
        }
    };
    info!(store = store.name(), prefix = %config.key_prefix, "Passive location configured");
    Ok(vec![Arc::new(PassiveCacheLocation::new(store, config))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::{CompressionAlgorithm, CompressionConfig};
    use crate::cache::entry::ValueEntry;
    use assert_matches::assert_matches;

    fn location(store: InMemoryStore) -> PassiveCacheLocation {
        PassiveCacheLocation::new(Arc::new(store), &PassiveStoreConfig::default())
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = InMemoryStore::new();
        let location = location(store.clone());
        let key = KeyHolder::from_storage_key("users:1");
        let entry = ValueEntry::new("alice".to_string());

        location.write(&key, &entry.to_bytes().unwrap(), None).await.unwrap();
        assert!(store.contains("smartcache:users:1"));

        let lookup = location.get(&key, None, &CancellationToken::new()).await;
        assert_matches!(lookup, LocationLookup::Found(out) => {
            assert_eq!(out.created_at, entry.created_at);
            assert_eq!(out.kind, LocationKind::Passive);
            let decoded: ValueEntry<String> = ValueEntry::from_slice(&out.payload).unwrap();
            assert_eq!(decoded.data, "alice");
        });
    }

    #[tokio::test]
    async fn test_stale_entry_is_reported() {
        let location = location(InMemoryStore::new());
        let key = KeyHolder::from_storage_key("k");
        let entry = ValueEntry::new(1u32);
        location.write(&key, &entry.to_bytes().unwrap(), None).await.unwrap();

        let minimum = entry.created_at + chrono::Duration::seconds(1);
        let lookup = location.get(&key, Some(minimum), &CancellationToken::new()).await;
        assert_matches!(lookup, LocationLookup::Invalid(InvalidReason::Stale { .. }));

        assert!(location.delete(&key).await.unwrap());
        let lookup = location.get(&key, None, &CancellationToken::new()).await;
        assert_matches!(lookup, LocationLookup::Miss);
    }

    #[tokio::test]
    async fn test_compressed_entries_roundtrip() {
        let store = InMemoryStore::new();
        let config = PassiveStoreConfig {
            compression: CompressionConfig {
                algorithm: CompressionAlgorithm::Zstd,
                min_size_bytes: 16,
                level: 3,
            },
            ..Default::default()
        };
        let location = PassiveCacheLocation::new(Arc::new(store.clone()), &config);
        let key = KeyHolder::from_storage_key("big");
        let entry = ValueEntry::new("abc".repeat(500));
        let raw = entry.to_bytes().unwrap();

        location.write(&key, &raw, None).await.unwrap();
        let stored = store.get("smartcache:big").await.unwrap().unwrap();
        assert_eq!(stored[0], CompressionAlgorithm::Zstd.tag());
        assert!(stored.len() < raw.len());

        let lookup = location.get(&key, None, &CancellationToken::new()).await;
        assert_matches!(lookup, LocationLookup::Found(out) if out.payload == raw);
    }

    #[tokio::test]
    async fn test_garbage_is_suspicious() {
        let store = InMemoryStore::new();
        store
            .set("smartcache:k", Bytes::from_static(&[9, 9, 9]), None)
            .await
            .unwrap();
        let location = location(store);

        let lookup = location
            .get(&KeyHolder::from_storage_key("k"), None, &CancellationToken::new())
            .await;
        assert_matches!(lookup, LocationLookup::Invalid(InvalidReason::Suspicious(_)));
    }

    #[tokio::test]
    async fn test_in_memory_store_ttl() {
        let store = InMemoryStore::new();
        store.set("a", Bytes::from_static(b"1"), Some(Duration::ZERO)).await.unwrap();
        store.set("b", Bytes::from_static(b"2"), None).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_cleanup_keeps_value_set_after_read() {
        let store = InMemoryStore::new();
        store.set("k", Bytes::from_static(b"old"), Some(Duration::ZERO)).await.unwrap();
        let read_at = Instant::now();

        // A fresh value lands between the expired read and the cleanup
        store.set("k", Bytes::from_static(b"new"), None).await.unwrap();
        assert!(!store.remove_expired("k", read_at));
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"new")));

        store.set("gone", Bytes::from_static(b"x"), Some(Duration::ZERO)).await.unwrap();
        assert!(store.remove_expired("gone", Instant::now()));
        assert!(!store.contains("gone"));
    }

    #[tokio::test]
    async fn test_factory_without_backend() {
        let locations = build_passive_locations(&PassiveStoreConfig::default()).await.unwrap();
        assert!(locations.is_empty());

        let config = PassiveStoreConfig {
            backend: PassiveBackend::InMemory,
            ..Default::default()
        };
        let locations = build_passive_locations(&config).await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].id().as_str(), "in-memory");
    }
}
