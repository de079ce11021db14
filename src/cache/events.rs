//! Cache Events
//!
//! Events broadcast by the engine for monitoring and observability.

use crate::companion::notifier::NotificationKind;
use crate::location::{LocationId, LocationKind};
use serde::{Deserialize, Serialize};

/// Events emitted by the cache engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Value served from a location
    Hit {
        key: String,
        location: LocationId,
        kind: LocationKind,
    },

    /// A location held an entry that was rejected
    InvalidEntry {
        key: String,
        location: LocationId,
        kind: LocationKind,
        reason: String,
    },

    /// Factory ran after every location missed
    Computed {
        key: String,
        elapsed_ms: u64,
    },

    /// Value stored in memory (and optionally written to passive stores)
    Stored {
        key: String,
        size_bytes: u64,
        passive: bool,
    },

    /// Entry left the memory tier
    Evicted {
        key: String,
        size_bytes: u64,
        reason: EvictionReason,
    },

    /// Invalidation rule applied locally
    Invalidated {
        rule: String,
        origin: LocationId,
        evicted: usize,
    },

    /// A companion announced it holds a value
    ExternalMiss {
        key: String,
        location: LocationId,
    },

    /// Delivery to one companion failed
    NotificationFailed {
        location: LocationId,
        kind: NotificationKind,
        error: String,
    },
}

/// Reason an entry left the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Byte budget reached
    Capacity,
    /// TTL elapsed
    Expired,
    /// Matched an invalidation rule
    Invalidated,
    /// Replaced by, or announced as, a newer value
    Superseded,
    /// Value too large for the memory tier
    Oversized,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Invalidated => write!(f, "invalidated"),
            EvictionReason::Superseded => write!(f, "superseded"),
            EvictionReason::Oversized => write!(f, "oversized"),
        }
    }
}

impl CacheEvent {
    /// Get the key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Hit { key, .. }
            | CacheEvent::InvalidEntry { key, .. }
            | CacheEvent::Computed { key, .. }
            | CacheEvent::Stored { key, .. }
            | CacheEvent::Evicted { key, .. }
            | CacheEvent::ExternalMiss { key, .. } => Some(key),
            CacheEvent::Invalidated { .. } | CacheEvent::NotificationFailed { .. } => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::NotificationFailed { .. } | CacheEvent::InvalidEntry { .. }
        )
    }
}
