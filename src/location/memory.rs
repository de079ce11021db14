//! Local Memory Location
//!
//! Adapts the memory tier to the [`CacheLocation`] contract. Memory never
//! declares its own entries stale: invalidations evict them eagerly, so the
//! minimum creation date is not consulted here.

use super::{CacheLocation, LocationId, LocationKind, LocationLookup, LocationOutput};
use crate::cache::key::KeyHolder;
use crate::cache::memory::{MemoryLookup, MemoryTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The process-local memory tier as a location
pub struct MemoryLocation {
    id: LocationId,
    tier: Arc<MemoryTier>,
}

impl MemoryLocation {
    pub fn new(tier: Arc<MemoryTier>) -> Self {
        Self {
            id: LocationId::from("memory"),
            tier,
        }
    }

    pub fn tier(&self) -> &Arc<MemoryTier> {
        &self.tier
    }

    /// Synchronous lookup; also reports an expired entry dropped on the way
    pub fn lookup(&self, key: &KeyHolder) -> MemoryLookup {
        self.tier.get(key.storage_key())
    }

    pub(crate) fn output(&self, lookup: MemoryLookup, started: Instant) -> LocationLookup {
        match lookup {
            MemoryLookup::Hit(entry) => LocationLookup::Found(LocationOutput {
                size_bytes: entry.size_bytes(),
                payload: entry.payload,
                created_at: entry.created_at,
                elapsed: started.elapsed(),
                location: self.id.clone(),
                kind: LocationKind::Memory,
                value: Some(entry.value),
            }),
            MemoryLookup::Expired(_) | MemoryLookup::Absent => LocationLookup::Miss,
        }
    }
}

#[async_trait]
impl CacheLocation for MemoryLocation {
    fn id(&self) -> &LocationId {
        &self.id
    }

    fn kind(&self) -> LocationKind {
        LocationKind::Memory
    }

    async fn get(
        &self,
        key: &KeyHolder,
        _minimum_creation_date: Option<DateTime<Utc>>,
        _cancel: &CancellationToken,
    ) -> LocationLookup {
        let started = Instant::now();
        self.output(self.lookup(key), started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::tests::entry;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_memory_location_ignores_minimum_date() {
        let tier = Arc::new(MemoryTier::new());
        tier.insert("k".into(), entry("k", "value", 16, None));
        let location = MemoryLocation::new(tier);

        let future = Utc::now() + chrono::Duration::hours(1);
        let lookup = location
            .get(&KeyHolder::from_storage_key("k"), Some(future), &CancellationToken::new())
            .await;

        assert_matches!(lookup, LocationLookup::Found(out) => {
            assert_eq!(out.kind, LocationKind::Memory);
            assert_eq!(out.size_bytes, 16);
            assert_eq!(out.value.unwrap().downcast_ref::<String>().unwrap(), "value");
        });
    }

    #[tokio::test]
    async fn test_memory_location_miss() {
        let location = MemoryLocation::new(Arc::new(MemoryTier::new()));
        let lookup = location
            .get(&KeyHolder::from_storage_key("absent"), None, &CancellationToken::new())
            .await;
        assert_matches!(lookup, LocationLookup::Miss);
    }
}
