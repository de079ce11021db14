//! Smart Cache Engine
//!
//! Coordinates the memory tier, companions and passive stores:
//!
//! 1. memory (synchronous, no await)
//! 2. active companions, queried in parallel; first valid answer wins
//! 3. passive locations, in order
//! 4. the caller's factory
//!
//! Steps 2-4 run once per key at a time, inside the in-flight registry.
//! Computed values are stamped with the time the computation started, kept in
//! memory, then written to passive stores and announced to companions in the
//! background.

use crate::cache::entry::{CacheValue, InvalidatedEntry, InvalidationCallback, ValueEntry};
use crate::cache::events::{CacheEvent, EvictionReason};
use crate::cache::inflight::{Attachment, ComputeFailure, InFlightRegistry, Resolution, Resolved};
use crate::cache::invalidation::{InvalidationLog, InvalidationRule};
use crate::cache::key::{CacheKey, KeyHolder};
use crate::cache::memory::{Evicted, MemoryEntry, MemoryLookup, MemoryTier};
use crate::cache::metrics::{CacheMetrics, CacheStatsSnapshot, FetchOutcome, MetricsRecorder, NoopRecorder};
use crate::companion::{
    broadcast_cache_miss, broadcast_invalidation, build_companion, self_addr_from_env, CacheCompanion,
    LocalCompanion, NotificationReport,
};
use crate::config::{EngineConfig, MemoryTierConfig, PeerLookup, SmartCacheConfig};
use crate::error::{BoxError, Error, Result, SharedError};
use crate::location::{
    build_passive_locations, CacheLocation, InvalidReason, LocationId, LocationKind, LocationLookup,
    LocationOutput, MemoryLocation,
};
use crate::protocol::{CacheMissDescriptor, InvalidationDescriptor};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::{type_name, Any};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

// =============================================================================
// Options & Reports
// =============================================================================

/// Per-call settings for [`SmartCache::get_with_options`] and [`SmartCache::set`]
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Memory TTL override
    pub ttl: Option<Duration>,
    /// Hook run when an invalidation rule evicts the entry
    pub on_invalidated: Option<InvalidationCallback>,
    /// Passive write-through override
    pub write_passive: Option<bool>,
}

impl GetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_on_invalidated(mut self, callback: InvalidationCallback) -> Self {
        self.on_invalidated = Some(callback);
        self
    }

    pub fn with_write_passive(mut self, write_passive: bool) -> Self {
        self.write_passive = Some(write_passive);
        self
    }
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("ttl", &self.ttl)
            .field("on_invalidated", &self.on_invalidated.is_some())
            .field("write_passive", &self.write_passive)
            .finish()
    }
}

/// Outcome of [`SmartCache::invalidate`]
#[derive(Debug, Clone)]
pub struct InvalidationReport {
    /// Canonical keys evicted from local memory
    pub evicted: Vec<String>,
    /// Passive entries deleted
    pub passive_deleted: usize,
    /// Broadcast outcome; `None` when companions could not be discovered
    pub notification: Option<NotificationReport>,
    pub discovery_error: Option<String>,
}

/// A serialized value read straight from memory
#[derive(Debug, Clone)]
pub struct DirectRead {
    pub type_name: &'static str,
    /// Serialized `ValueEntry`
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

/// A value accepted from a location, decoded for the caller's type
struct Fetched<T> {
    output: LocationOutput,
    data: T,
}

enum Accepted<T> {
    Value(Fetched<T>),
    Miss,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
enum InsertMode {
    /// Explicit writes always win
    Replace,
    /// Resolved values never overwrite a newer entry
    IfNewer,
}

/// What happened to a value offered to the memory tier
enum MemoryWrite {
    Stored,
    /// Too large for memory; still eligible for passive stores
    Oversized,
    /// An invalidation recorded after the value was created covers it
    Stale,
    /// Memory already holds this newer entry
    Outdated(MemoryEntry),
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SmartCache`]
#[derive(Default)]
pub struct SmartCacheBuilder {
    memory: MemoryTierConfig,
    engine: EngineConfig,
    companion: Option<Arc<dyn CacheCompanion>>,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl SmartCacheBuilder {
    pub fn memory(mut self, config: MemoryTierConfig) -> Self {
        self.memory = config;
        self
    }

    pub fn engine(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    pub fn companion(mut self, companion: Arc<dyn CacheCompanion>) -> Self {
        self.companion = Some(companion);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn build(self) -> Arc<SmartCache> {
        let memory = Arc::new(MemoryTier::with_config(&self.memory));
        let companion = self
            .companion
            .unwrap_or_else(|| Arc::new(LocalCompanion::default()));
        let (events, _) = broadcast::channel(self.engine.event_channel_capacity.max(1));

        info!(
            self_id = %companion.self_location_id(),
            passive_locations = companion.passive_locations().len(),
            capacity_bytes = self.memory.capacity_bytes,
            cancellation = ?self.engine.cancellation,
            peer_lookup = ?self.engine.peer_lookup,
            "Smart cache initialized"
        );

        Arc::new(SmartCache {
            memory_location: MemoryLocation::new(Arc::clone(&memory)),
            memory,
            in_flight: Arc::new(InFlightRegistry::new(self.engine.cancellation)),
            invalidations: InvalidationLog::new(self.engine.invalidation_retention()),
            holders: DashMap::new(),
            companion,
            metrics: CacheMetrics::new(),
            recorder: self.recorder.unwrap_or_else(|| Arc::new(NoopRecorder)),
            events,
            background: TaskTracker::new(),
            config: self.engine,
        })
    }
}

// =============================================================================
// Smart Cache
// =============================================================================

/// Multi-location cache with stampede protection
pub struct SmartCache {
    config: EngineConfig,
    memory: Arc<MemoryTier>,
    memory_location: MemoryLocation,
    companion: Arc<dyn CacheCompanion>,
    in_flight: Arc<InFlightRegistry>,
    invalidations: InvalidationLog,
    /// Companions that announced a value per key, with its creation date
    holders: DashMap<String, HashMap<LocationId, DateTime<Utc>>>,
    metrics: CacheMetrics,
    recorder: Arc<dyn MetricsRecorder>,
    events: broadcast::Sender<CacheEvent>,
    background: TaskTracker,
}

impl SmartCache {
    pub fn builder() -> SmartCacheBuilder {
        SmartCacheBuilder::default()
    }

    /// Single-process cache with default settings
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Build the passive locations and companion described by `config`
    pub async fn from_config(config: &SmartCacheConfig, recorder: Arc<dyn MetricsRecorder>) -> Result<Arc<Self>> {
        config.validate()?;
        let passive = build_passive_locations(&config.passive).await?;
        let self_addr = self_addr_from_env(&config.companion);
        let companion = build_companion(&config.companion, self_addr, passive).await?;

        Ok(Self::builder()
            .memory(config.memory.clone())
            .engine(config.engine.clone())
            .companion(companion)
            .recorder(recorder)
            .build())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn companion(&self) -> &Arc<dyn CacheCompanion> {
        &self.companion
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot::capture(
            &self.metrics,
            self.memory.len(),
            self.memory.size_bytes(),
            self.in_flight.len(),
        )
    }

    /// Wait for outstanding passive writes, notifications and callbacks
    pub async fn flush_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    fn emit_evicted(&self, evicted: &Evicted) {
        self.emit(CacheEvent::Evicted {
            key: evicted.storage_key.clone(),
            size_bytes: evicted.entry.size_bytes(),
            reason: evicted.reason,
        });
    }

    fn record_fetch(&self, kind: LocationKind, outcome: FetchOutcome, elapsed: Duration, size_bytes: u64) {
        self.metrics.location(kind).record(outcome, elapsed, size_bytes);
        self.recorder.record_fetch(kind, outcome, elapsed, size_bytes);
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Cached value for `key`, computed by `factory` if no location has one
    pub async fn get<K, T, F, Fut, E>(self: &Arc<Self>, key: K, factory: F, cancel: &CancellationToken) -> Result<T>
    where
        K: CacheKey,
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.get_with_options(key, factory, GetOptions::default(), cancel).await
    }

    /// [`SmartCache::get`] with per-call options
    pub async fn get_with_options<K, T, F, Fut, E>(
        self: &Arc<Self>,
        key: K,
        factory: F,
        options: GetOptions,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        K: CacheKey,
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let holder = KeyHolder::new(key);
        let storage_key = holder.storage_key().to_string();

        if let Some(value) = self.memory_hit::<T>(&holder)? {
            return Ok(value);
        }

        let this = Arc::clone(self);
        let Attachment { future, guard, initiated } =
            self.in_flight.join(&storage_key, cancel, move |token| {
                this.resolve::<T, F, Fut, E>(holder, factory, options, token).boxed()
            });
        if !initiated {
            debug!(key = %storage_key, "Awaiting shared resolution");
        }

        let resolution = tokio::select! {
            resolution = future => resolution,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        drop(guard);

        let resolved = resolution.map_err(Error::from)?;
        materialize::<T>(&storage_key, &resolved.value, &resolved.payload)
    }

    /// Memory fast path
    fn memory_hit<T: CacheValue>(&self, holder: &KeyHolder) -> Result<Option<T>> {
        let started = Instant::now();
        let lookup = self.memory_location.lookup(holder);
        if let MemoryLookup::Expired(evicted) = &lookup {
            self.emit_evicted(evicted);
        }

        match self.memory_location.output(lookup, started) {
            LocationLookup::Found(output) => {
                self.record_fetch(LocationKind::Memory, FetchOutcome::Hit, output.elapsed, output.size_bytes);
                self.emit(CacheEvent::Hit {
                    key: holder.storage_key().to_string(),
                    location: output.location.clone(),
                    kind: LocationKind::Memory,
                });
                let value = match &output.value {
                    Some(value) => materialize::<T>(holder.storage_key(), value, &output.payload)?,
                    None => ValueEntry::<T>::from_slice(&output.payload)?.data,
                };
                Ok(Some(value))
            }
            _ => {
                self.record_fetch(LocationKind::Memory, FetchOutcome::Miss, started.elapsed(), 0);
                Ok(None)
            }
        }
    }

    /// Everything after the memory fast path; runs once per key at a time
    async fn resolve<T, F, Fut, E>(
        self: Arc<Self>,
        holder: KeyHolder,
        factory: F,
        options: GetOptions,
        token: CancellationToken,
    ) -> Resolution
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        // Filled by a resolution that settled after our fast path
        if let MemoryLookup::Hit(entry) = self.memory.get(holder.storage_key()) {
            return Ok(Arc::new(Resolved::from(entry)));
        }

        let minimum = self.invalidations.minimum_creation_date(&holder);

        if let Some(fetched) = self.fetch_from_active::<T>(&holder, minimum, &token).await {
            return Ok(self.adopt(&holder, fetched, &options));
        }
        if token.is_cancelled() {
            return Err(ComputeFailure::Cancelled);
        }
        if let Some(fetched) = self.fetch_from_passive::<T>(&holder, minimum, &token).await {
            return Ok(self.adopt(&holder, fetched, &options));
        }
        if token.is_cancelled() {
            return Err(ComputeFailure::Cancelled);
        }

        self.compute(holder, factory, options, token).await
    }

    async fn fetch_from_active<T: CacheValue>(
        self: &Arc<Self>,
        holder: &KeyHolder,
        minimum: Option<DateTime<Utc>>,
        token: &CancellationToken,
    ) -> Option<Fetched<T>> {
        let candidates = match self.config.peer_lookup {
            PeerLookup::KnownHolders => {
                let known = self.known_holders(holder.storage_key(), minimum);
                if known.is_empty() {
                    return None;
                }
                Some(known)
            }
            PeerLookup::AllCompanions => None,
        };

        let locations = match self.companion.active_locations(candidates.as_ref()).await {
            Ok(locations) => locations,
            Err(e) => {
                warn!(key = %holder, error = %e, "Companion discovery failed, skipping peers");
                return None;
            }
        };
        if locations.is_empty() {
            return None;
        }

        let mut pending: FuturesUnordered<_> = locations
            .iter()
            .map(|location| async move { (location, location.get(holder, minimum, token).await) })
            .collect();

        while let Some((location, lookup)) = pending.next().await {
            if token.is_cancelled() {
                return None;
            }
            match self.accept::<T>(holder, &**location, lookup) {
                Accepted::Value(fetched) => return Some(fetched),
                Accepted::Miss | Accepted::Invalid => self.forget_holder(holder.storage_key(), location.id()),
            }
        }
        None
    }

    async fn fetch_from_passive<T: CacheValue>(
        self: &Arc<Self>,
        holder: &KeyHolder,
        minimum: Option<DateTime<Utc>>,
        token: &CancellationToken,
    ) -> Option<Fetched<T>> {
        for location in self.companion.passive_locations() {
            let lookup = location.get(holder, minimum, token).await;
            if token.is_cancelled() {
                return None;
            }
            match self.accept::<T>(holder, &**location, lookup) {
                Accepted::Value(fetched) => return Some(fetched),
                Accepted::Miss => {}
                // Removed before the fallback continues so a later write-through is never undone
                Accepted::Invalid => match location.delete(holder).await {
                    Ok(deleted) => debug!(key = %holder, location = %location.id(), deleted, "Removed invalid passive entry"),
                    Err(e) => warn!(key = %holder, location = %location.id(), error = %e, "Failed to remove invalid passive entry"),
                },
            }
        }
        None
    }

    /// Classify one location's answer for the caller's value type
    fn accept<T: CacheValue>(&self, holder: &KeyHolder, location: &dyn CacheLocation, lookup: LocationLookup) -> Accepted<T> {
        let kind = location.kind();
        match lookup {
            LocationLookup::Found(output) => match ValueEntry::<T>::from_slice(&output.payload) {
                Ok(entry) => {
                    self.record_fetch(kind, FetchOutcome::Hit, output.elapsed, output.size_bytes);
                    debug!(key = %holder, location = %output.location, kind = %kind, "Location hit");
                    self.emit(CacheEvent::Hit {
                        key: holder.storage_key().to_string(),
                        location: output.location.clone(),
                        kind,
                    });
                    Accepted::Value(Fetched {
                        output,
                        data: entry.data,
                    })
                }
                Err(e) => {
                    let reason = InvalidReason::Suspicious(format!("payload is not a {}: {}", type_name::<T>(), e));
                    self.note_invalid(holder, location, reason, output.elapsed);
                    Accepted::Invalid
                }
            },
            LocationLookup::Miss => {
                self.record_fetch(kind, FetchOutcome::Miss, Duration::ZERO, 0);
                Accepted::Miss
            }
            LocationLookup::Invalid(reason) => {
                self.note_invalid(holder, location, reason, Duration::ZERO);
                Accepted::Invalid
            }
        }
    }

    fn note_invalid(&self, holder: &KeyHolder, location: &dyn CacheLocation, reason: InvalidReason, elapsed: Duration) {
        self.record_fetch(location.kind(), FetchOutcome::Invalid, elapsed, 0);
        debug!(key = %holder, location = %location.id(), reason = %reason, "Rejected location entry");
        self.emit(CacheEvent::InvalidEntry {
            key: holder.storage_key().to_string(),
            location: location.id().clone(),
            kind: location.kind(),
            reason: reason.to_string(),
        });
    }

    /// Keep a value fetched from another location
    fn adopt<T: CacheValue>(&self, holder: &KeyHolder, fetched: Fetched<T>, options: &GetOptions) -> Arc<Resolved> {
        let Fetched { output, data } = fetched;
        let value: Arc<dyn Any + Send + Sync> = Arc::new(data);
        let write = self.store_in_memory(
            holder,
            Arc::clone(&value),
            type_name::<T>(),
            output.payload.clone(),
            output.created_at,
            options,
            InsertMode::IfNewer,
            false,
        );
        if let MemoryWrite::Outdated(newer) = write {
            return Arc::new(Resolved::from(newer));
        }
        Arc::new(Resolved {
            value,
            payload: output.payload,
            created_at: output.created_at,
        })
    }

    async fn compute<T, F, Fut, E>(
        self: Arc<Self>,
        holder: KeyHolder,
        factory: F,
        options: GetOptions,
        token: CancellationToken,
    ) -> Resolution
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let created_at = Utc::now();
        let started = Instant::now();

        let outcome: std::result::Result<T, SharedError> = tokio::select! {
            outcome = factory() => outcome.map_err(|e| Arc::from(e.into())),
            _ = token.cancelled() => {
                debug!(key = %holder, "Computation cancelled");
                return Err(ComputeFailure::Cancelled);
            }
        };
        let elapsed = started.elapsed();
        self.metrics.record_factory(outcome.is_ok());
        self.recorder.record_factory(elapsed, outcome.is_ok());

        let data = match outcome {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %holder, error = %e, "Value factory failed");
                return Err(ComputeFailure::Factory(e));
            }
        };

        let entry = ValueEntry::with_created_at(data, created_at);
        let payload = entry.to_bytes().map_err(|e| ComputeFailure::Engine(Arc::new(e)))?;
        debug!(key = %holder, elapsed_ms = elapsed.as_millis() as u64, size_bytes = payload.len(), "Computed value");
        self.emit(CacheEvent::Computed {
            key: holder.storage_key().to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        let value: Arc<dyn Any + Send + Sync> = Arc::new(entry.data);
        let write_passive = options.write_passive.unwrap_or(self.config.write_passive);
        let write = self.store_in_memory(
            &holder,
            Arc::clone(&value),
            type_name::<T>(),
            payload.clone(),
            created_at,
            &options,
            InsertMode::IfNewer,
            write_passive,
        );
        match write {
            MemoryWrite::Stored => self.spawn_publish(holder, payload.clone(), created_at, options.ttl, write_passive, true),
            MemoryWrite::Oversized => self.spawn_publish(holder, payload.clone(), created_at, options.ttl, write_passive, false),
            // Callers still get the value they asked for; it just is not kept anywhere
            MemoryWrite::Stale => {}
            MemoryWrite::Outdated(newer) => return Ok(Arc::new(Resolved::from(newer))),
        }

        Ok(Arc::new(Resolved {
            value,
            payload,
            created_at,
        }))
    }

    /// True when an invalidation recorded after `created_at` covers the key
    fn predates_invalidation(&self, holder: &KeyHolder, created_at: DateTime<Utc>) -> bool {
        self.invalidations
            .minimum_creation_date(holder)
            .is_some_and(|minimum| created_at < minimum)
    }

    /// Insert into memory unless an invalidation newer than the value applies
    #[allow(clippy::too_many_arguments)]
    fn store_in_memory(
        &self,
        holder: &KeyHolder,
        value: Arc<dyn Any + Send + Sync>,
        type_name: &'static str,
        payload: Bytes,
        created_at: DateTime<Utc>,
        options: &GetOptions,
        mode: InsertMode,
        passive: bool,
    ) -> MemoryWrite {
        if self.predates_invalidation(holder, created_at) {
            debug!(key = %holder, "Value predates an invalidation, not keeping it");
            return MemoryWrite::Stale;
        }

        let size_bytes = payload.len() as u64;
        let entry = MemoryEntry {
            key: Arc::clone(holder.key()),
            value,
            payload,
            created_at,
            type_name,
            expires_at: self.memory.deadline(options.ttl),
            on_invalidated: options.on_invalidated.clone(),
        };
        let storage_key = holder.storage_key().to_string();
        let outcome = match mode {
            InsertMode::Replace => self.memory.insert(storage_key, entry),
            InsertMode::IfNewer => self.memory.insert_if_newer(storage_key, entry),
        };
        for evicted in &outcome.evicted {
            self.emit_evicted(evicted);
        }
        if let Some(newer) = outcome.newer {
            debug!(key = %holder, kept = %newer.created_at, "Memory already holds a newer value");
            return MemoryWrite::Outdated(newer);
        }
        if !outcome.stored {
            return MemoryWrite::Oversized;
        }

        // An invalidation may have swept memory between the check and the insert
        if self.predates_invalidation(holder, created_at) {
            self.memory
                .remove_if(holder.storage_key(), |entry| entry.created_at == created_at);
            return MemoryWrite::Stale;
        }

        self.emit(CacheEvent::Stored {
            key: holder.storage_key().to_string(),
            size_bytes,
            passive,
        });
        MemoryWrite::Stored
    }

    /// Write through to passive stores and, when the value is held in
    /// memory, announce it to companions
    fn spawn_publish(
        self: &Arc<Self>,
        holder: KeyHolder,
        payload: Bytes,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
        write_passive: bool,
        announce: bool,
    ) {
        let this = Arc::clone(self);
        self.background.spawn(async move {
            if write_passive {
                for location in this.companion.passive_locations() {
                    if this.predates_invalidation(&holder, created_at) {
                        debug!(key = %holder, "Value invalidated before write-through, not publishing");
                        return;
                    }
                    if let Err(e) = location.write(&holder, &payload, ttl).await {
                        warn!(key = %holder, location = %location.id(), error = %e, "Passive write failed");
                        continue;
                    }
                    // The invalidation's own delete may have run before this write landed
                    if this.predates_invalidation(&holder, created_at) {
                        if let Err(e) = location.delete(&holder).await {
                            warn!(key = %holder, location = %location.id(), error = %e, "Failed to undo stale write-through");
                        }
                        return;
                    }
                }
            }
            if !announce || this.predates_invalidation(&holder, created_at) {
                return;
            }

            let notifiers = match this.companion.event_notifiers().await {
                Ok(notifiers) => notifiers,
                Err(e) => {
                    warn!(key = %holder, error = %e, "Companion discovery failed, cache miss not announced");
                    return;
                }
            };
            if notifiers.is_empty() {
                return;
            }
            let descriptor = CacheMissDescriptor {
                key: holder.storage_key().to_string(),
                location_id: this.companion.self_location_id().clone(),
                created_at,
            };
            let report = broadcast_cache_miss(&notifiers, &descriptor).await;
            this.record_report(&report);
        });
    }

    fn record_report(&self, report: &NotificationReport) {
        self.metrics
            .record_notifications(report.delivered.len() as u64, report.failed.len() as u64);
        for _ in &report.delivered {
            self.recorder.record_notification(report.kind, true);
        }
        for failure in &report.failed {
            self.recorder.record_notification(report.kind, false);
            self.emit(CacheEvent::NotificationFailed {
                location: failure.location.clone(),
                kind: report.kind,
                error: failure.error.clone(),
            });
        }
    }

    // =========================================================================
    // Known Holders
    // =========================================================================

    fn known_holders(&self, storage_key: &str, minimum: Option<DateTime<Utc>>) -> HashSet<LocationId> {
        self.holders
            .get(storage_key)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|(_, created_at)| minimum.map_or(true, |minimum| **created_at >= minimum))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn forget_holder(&self, storage_key: &str, location: &LocationId) {
        let now_empty = match self.holders.get_mut(storage_key) {
            Some(mut holders) => {
                holders.remove(location);
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.holders.remove_if(storage_key, |_, holders| holders.is_empty());
        }
    }

    /// Number of keys with at least one known holder
    pub fn tracked_keys(&self) -> usize {
        self.holders.len()
    }

    // =========================================================================
    // Companion Notifications
    // =========================================================================

    /// A companion announced it holds a value for a key
    pub fn add_external_miss(&self, descriptor: CacheMissDescriptor) {
        if &descriptor.location_id == self.companion.self_location_id() {
            return;
        }
        self.metrics.external_misses.fetch_add(1, Ordering::Relaxed);

        if !self.holders.contains_key(&descriptor.key) && self.holders.len() >= self.config.max_tracked_keys {
            let victim = self.holders.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.holders.remove(&victim);
            }
        }
        self.holders
            .entry(descriptor.key.clone())
            .or_default()
            .insert(descriptor.location_id.clone(), descriptor.created_at);

        let superseded = self
            .memory
            .remove_if(&descriptor.key, |entry| entry.created_at < descriptor.created_at);
        if let Some(entry) = superseded {
            debug!(key = %descriptor.key, location = %descriptor.location_id, "Local value superseded by companion");
            self.emit(CacheEvent::Evicted {
                key: descriptor.key.clone(),
                size_bytes: entry.size_bytes(),
                reason: EvictionReason::Superseded,
            });
        }

        debug!(key = %descriptor.key, location = %descriptor.location_id, "Recorded companion holder");
        self.emit(CacheEvent::ExternalMiss {
            key: descriptor.key,
            location: descriptor.location_id,
        });
    }

    /// Apply an invalidation received from a companion, without re-broadcasting
    pub fn apply_external_invalidation(&self, descriptor: InvalidationDescriptor) -> Vec<String> {
        let applied_at = descriptor.issued_at.min(Utc::now());
        self.apply_invalidation(&descriptor.rule, applied_at, descriptor.origin)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Evict matching entries here, in passive stores, and on every companion
    pub async fn invalidate(self: &Arc<Self>, rule: InvalidationRule) -> InvalidationReport {
        let issued_at = Utc::now();
        let origin = self.companion.self_location_id().clone();
        let evicted = self.apply_invalidation(&rule, issued_at, origin.clone());

        let mut keys: Vec<KeyHolder> = evicted.iter().cloned().map(KeyHolder::from_storage_key).collect();
        if let Some(exact) = rule.exact_key() {
            if !evicted.iter().any(|key| key == exact) {
                keys.push(KeyHolder::from_storage_key(exact));
            }
        }
        let mut passive_deleted = 0;
        for location in self.companion.passive_locations() {
            for key in &keys {
                match location.delete(key).await {
                    Ok(true) => passive_deleted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key = %key, location = %location.id(), error = %e, "Passive delete failed"),
                }
            }
        }

        let descriptor = InvalidationDescriptor {
            rule,
            issued_at,
            origin,
        };
        let (notification, discovery_error) = match self.companion.event_notifiers().await {
            Ok(notifiers) => {
                let report = broadcast_invalidation(&notifiers, &descriptor).await;
                self.record_report(&report);
                (Some(report), None)
            }
            Err(e) => {
                warn!(rule = %descriptor.rule, error = %e, "Companion discovery failed, invalidation not broadcast");
                (None, Some(e.to_string()))
            }
        };

        InvalidationReport {
            evicted,
            passive_deleted,
            notification,
            discovery_error,
        }
    }

    /// Drop `key` everywhere
    pub async fn remove<K: CacheKey>(self: &Arc<Self>, key: &K) -> InvalidationReport {
        self.invalidate(InvalidationRule::key(key)).await
    }

    fn apply_invalidation(&self, rule: &InvalidationRule, applied_at: DateTime<Utc>, origin: LocationId) -> Vec<String> {
        self.invalidations.record(rule.clone(), applied_at);
        let removed = self
            .memory
            .remove_matching(|_, entry| entry.key.is_invalidated_by(rule));
        self.holders.retain(|key, _| !rule.matches_storage_key(key));

        let mut evicted = Vec::with_capacity(removed.len());
        for (storage_key, entry) in removed {
            self.emit(CacheEvent::Evicted {
                key: storage_key.clone(),
                size_bytes: entry.size_bytes(),
                reason: EvictionReason::Invalidated,
            });
            if let Some(callback) = &entry.on_invalidated {
                self.background.spawn(callback(InvalidatedEntry {
                    key: storage_key.clone(),
                    created_at: entry.created_at,
                    rule: rule.clone(),
                }));
            }
            evicted.push(storage_key);
        }

        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        info!(rule = %rule, origin = %origin, evicted = evicted.len(), "Applied invalidation");
        self.emit(CacheEvent::Invalidated {
            rule: rule.to_string(),
            origin,
            evicted: evicted.len(),
        });
        evicted
    }

    // =========================================================================
    // Direct Access
    // =========================================================================

    /// Serialized value from memory only; never consults other locations
    pub fn try_get_direct_from_memory(&self, storage_key: &str) -> Option<DirectRead> {
        match self.memory.get(storage_key) {
            MemoryLookup::Hit(entry) => Some(DirectRead {
                type_name: entry.type_name,
                payload: entry.payload,
                created_at: entry.created_at,
            }),
            MemoryLookup::Expired(evicted) => {
                self.emit_evicted(&evicted);
                None
            }
            MemoryLookup::Absent => None,
        }
    }

    /// Typed value from memory only
    pub fn try_get_from_memory<K: CacheKey, T: CacheValue>(&self, key: &K) -> Option<T> {
        let storage_key = key.storage_key();
        match self.memory.get(&storage_key) {
            MemoryLookup::Hit(entry) => materialize::<T>(&storage_key, &entry.value, &entry.payload).ok(),
            _ => None,
        }
    }

    /// Store a value here, write it to passive stores and announce it
    pub fn set<K: CacheKey, T: CacheValue>(self: &Arc<Self>, key: K, value: T, options: GetOptions) -> Result<()> {
        let holder = KeyHolder::new(key);
        let entry = ValueEntry::new(value);
        let payload = entry.to_bytes()?;
        let created_at = entry.created_at;
        let write_passive = options.write_passive.unwrap_or(self.config.write_passive);

        let write = self.store_in_memory(
            &holder,
            Arc::new(entry.data),
            type_name::<T>(),
            payload.clone(),
            created_at,
            &options,
            InsertMode::Replace,
            write_passive,
        );
        match write {
            MemoryWrite::Stored => self.spawn_publish(holder, payload, created_at, options.ttl, write_passive, true),
            MemoryWrite::Oversized => self.spawn_publish(holder, payload, created_at, options.ttl, write_passive, false),
            MemoryWrite::Stale | MemoryWrite::Outdated(_) => {}
        }
        Ok(())
    }
}

impl From<MemoryEntry> for Resolved {
    fn from(entry: MemoryEntry) -> Self {
        Resolved {
            value: entry.value,
            payload: entry.payload,
            created_at: entry.created_at,
        }
    }
}

/// Downcast a materialized value, falling back to its serialized form
fn materialize<T: CacheValue>(storage_key: &str, value: &Arc<dyn Any + Send + Sync>, payload: &Bytes) -> Result<T> {
    if let Some(value) = value.downcast_ref::<T>() {
        return Ok(value.clone());
    }
    ValueEntry::<T>::from_slice(payload)
        .map(|entry| entry.data)
        .map_err(|_| Error::TypeMismatch {
            key: storage_key.to_string(),
            expected: type_name::<T>(),
        })
}
