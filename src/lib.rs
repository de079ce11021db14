//! Smart Cache - Multi-Location Distributed Cache
//!
//! A read-through cache for a fleet of identical processes. Each process
//! keeps hot values in memory, asks its companions for values they already
//! computed, falls back to shared passive stores such as Redis, and only then
//! runs the caller's factory, once per key across concurrent callers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Cache Node                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   SmartCache    │  │   In-Flight     │  │     Invalidation Log        │  │
//! │  │   (engine)      │  │   Registry      │  │     (rules + dates)         │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Memory Tier (LRU,    │                                │
//! │                    │  sharded, byte-bound) │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                            Companions                                       │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Discovery     │  │  Active peers   │  │   Event notifiers           │  │
//! │  │ (DNS/Endpoints) │  │  (POST get)     │  │ (cachemiss / invalidate)    │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Passive Stores                                     │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │      Redis                  │  │           In-memory                 │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Engine, keys, entries, memory tier, invalidation, metrics
//! - [`location`]: Memory, active and passive cache locations
//! - [`companion`]: Peer discovery, topology and event notification
//! - [`protocol`]: Companion wire protocol, middleware and server
//! - [`config`]: Node configuration
//! - [`error`]: Error types and handling

pub mod cache;
pub mod companion;
pub mod config;
pub mod error;
pub mod location;
pub mod protocol;

// Re-export commonly used types
pub use cache::{
    on_invalidated, CacheEvent, CacheKey, CacheStatsSnapshot, CacheValue, DirectRead, EvictionReason,
    GetOptions, InvalidatedEntry, InvalidationReport, InvalidationRule, JsonKey, KeyHolder, MetricsRecorder,
    NamedKey, NoopRecorder, PrometheusRecorder, SmartCache, SmartCacheBuilder, ValueEntry,
};

pub use companion::{
    build_companion, CacheCompanion, CacheEventNotifier, CompanionPaths, HttpCompanion, LocalCompanion,
    NotificationReport, PeerDiscovery,
};

pub use config::{
    CancellationPolicy, CompanionConfig, DiscoveryConfig, EngineConfig, MemoryTierConfig, PassiveBackend,
    PassiveStoreConfig, PeerLookup, SmartCacheConfig,
};

pub use error::{BoxError, Error, Result};

pub use location::{
    ActiveCacheLocation, CacheLocation, InMemoryStore, LocationId, LocationKind, PassiveCacheLocation,
    PassiveStore, RedisStore,
};

pub use protocol::{CompanionRoutes, CompanionServer, CompanionServerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
