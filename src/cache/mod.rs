//! Smart Cache
//!
//! Read-through cache shared by a fleet of companion processes. A lookup
//! walks the locations in order and stops at the first valid value:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            SmartCache::get                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │   ┌──────────┐    ┌──────────────────┐    ┌───────────┐   ┌─────────┐ │
//! │   │  Memory  │ -> │ Active companions│ -> │  Passive  │ ->│ Factory │ │
//! │   │ (sharded │    │ (parallel HTTP,  │    │  stores   │   │ (once   │ │
//! │   │   LRU)   │    │ first valid wins)│    │ (Redis..) │   │ per key)│ │
//! │   └──────────┘    └──────────────────┘    └───────────┘   └─────────┘ │
//! │                                                                      │
//! │   invalidation log: values older than a matching rule are rejected   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use smart_cache::cache::{NamedKey, SmartCache};
//! use tokio_util::sync::CancellationToken;
//!
//! let cache = SmartCache::new();
//! let key = NamedKey::new("users", "42");
//!
//! let name: String = cache
//!     .get(key, || async { Ok::<_, std::io::Error>("Ada".to_string()) }, &CancellationToken::new())
//!     .await?;
//!
//! cache.invalidate(NamedKey::namespace_rule("users")).await;
//! ```

pub mod compression;
pub mod engine;
pub mod entry;
pub mod events;
pub mod inflight;
pub mod invalidation;
pub mod key;
pub mod memory;
pub mod metrics;

// Re-export main types
pub use compression::{CompressionAlgorithm, CompressionConfig, PayloadCodec};
pub use engine::{DirectRead, GetOptions, InvalidationReport, SmartCache, SmartCacheBuilder};
pub use entry::{on_invalidated, CacheValue, InvalidatedEntry, InvalidationCallback, ValueEntry};
pub use events::{CacheEvent, EvictionReason};
pub use invalidation::{InvalidationLog, InvalidationRule};
pub use key::{canonical_json, CacheKey, JsonKey, KeyHolder, NamedKey};
pub use memory::{MemoryEntry, MemoryTier};
pub use metrics::{
    CacheMetrics, CacheStatsSnapshot, FetchOutcome, LocationMetricsSnapshot, MetricsRecorder, NoopRecorder,
    PrometheusRecorder,
};
