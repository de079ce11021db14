//! Cache Locations
//!
//! Every place a value can be fetched from implements [`CacheLocation`]:
//!
//! - [`MemoryLocation`]: this process' memory tier, always consulted first
//! - [`ActiveCacheLocation`]: a companion process asked over HTTP
//! - [`PassiveCacheLocation`]: a shared store such as Redis
//!
//! A lookup never fails. Not-found, unreachable and stale all degrade to a
//! non-`Found` outcome for that location only, and the engine moves on to the
//! next one. Stale or suspicious entries are reported as
//! [`LocationLookup::Invalid`] so the engine can decide how to clean up.

pub mod active;
pub mod memory;
pub mod passive;
pub mod redis;

pub use active::ActiveCacheLocation;
pub use memory::MemoryLocation;
pub use passive::{build_passive_locations, InMemoryStore, PassiveCacheLocation, PassiveStore};
pub use self::redis::{RedisStore, RedisStoreConfig};

use crate::cache::key::KeyHolder;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Location Identity
// =============================================================================

/// Transport identity of a location (peer address, store name, "memory")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for LocationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<std::net::SocketAddr> for LocationId {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Category of location, used for metrics and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    Memory,
    Active,
    Passive,
}

impl LocationKind {
    pub const ALL: [LocationKind; 3] = [
        LocationKind::Memory,
        LocationKind::Active,
        LocationKind::Passive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LocationKind::Memory => "memory",
            LocationKind::Active => "active",
            LocationKind::Passive => "passive",
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Lookup Outcome
// =============================================================================

/// A successful fetch from one location
#[derive(Clone)]
pub struct LocationOutput {
    /// Serialized `ValueEntry` as stored / transferred
    pub payload: Bytes,
    /// Creation date carried by the entry
    pub created_at: DateTime<Utc>,
    /// Serialized size, for metrics and memory accounting
    pub size_bytes: u64,
    /// Time spent fetching
    pub elapsed: Duration,
    /// Where the value came from
    pub location: LocationId,
    pub kind: LocationKind,
    /// Already materialized value (memory tier only)
    pub value: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for LocationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationOutput")
            .field("created_at", &self.created_at)
            .field("size_bytes", &self.size_bytes)
            .field("elapsed", &self.elapsed)
            .field("location", &self.location)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Why a location's entry was rejected
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidReason {
    /// Created before the caller's minimum creation date
    Stale {
        created_at: DateTime<Utc>,
        minimum: DateTime<Utc>,
    },
    /// Unexpected answer (bad status, undecodable payload)
    Suspicious(String),
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::Stale { created_at, minimum } => {
                write!(f, "stale entry created {} (minimum {})", created_at, minimum)
            }
            InvalidReason::Suspicious(reason) => write!(f, "{}", reason),
        }
    }
}

/// Outcome of asking one location for a key
#[derive(Debug, Clone)]
pub enum LocationLookup {
    Found(LocationOutput),
    Miss,
    Invalid(InvalidReason),
}

impl LocationLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, LocationLookup::Found(_))
    }

    /// Classify a serialized entry against the minimum creation date
    pub(crate) fn from_payload(
        payload: Bytes,
        minimum: Option<DateTime<Utc>>,
        location: &LocationId,
        kind: LocationKind,
        elapsed: Duration,
    ) -> Self {
        let header = match crate::cache::entry::EntryHeader::from_slice(&payload) {
            Ok(header) => header,
            Err(e) => {
                return LocationLookup::Invalid(InvalidReason::Suspicious(format!(
                    "undecodable entry: {}",
                    e
                )))
            }
        };
        if let Some(minimum) = minimum {
            if header.created_at < minimum {
                return LocationLookup::Invalid(InvalidReason::Stale {
                    created_at: header.created_at,
                    minimum,
                });
            }
        }
        LocationLookup::Found(LocationOutput {
            size_bytes: payload.len() as u64,
            payload,
            created_at: header.created_at,
            elapsed,
            location: location.clone(),
            kind,
            value: None,
        })
    }
}

// =============================================================================
// CacheLocation Trait
// =============================================================================

/// A source the engine can ask for a key
#[async_trait]
pub trait CacheLocation: Send + Sync {
    fn id(&self) -> &LocationId;

    fn kind(&self) -> LocationKind;

    /// Look `key` up, rejecting entries created before `minimum_creation_date`
    async fn get(
        &self,
        key: &KeyHolder,
        minimum_creation_date: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> LocationLookup;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::ValueEntry;
    use assert_matches::assert_matches;

    #[test]
    fn test_payload_classification() {
        let id = LocationId::from("redis");
        let entry = ValueEntry::new("v".to_string());
        let payload = entry.to_bytes().unwrap();

        assert_matches!(
            LocationLookup::from_payload(payload.clone(), None, &id, LocationKind::Passive, Duration::ZERO),
            LocationLookup::Found(out) if out.created_at == entry.created_at && out.size_bytes == payload.len() as u64
        );

        let later = entry.created_at + chrono::Duration::seconds(1);
        assert_matches!(
            LocationLookup::from_payload(payload, Some(later), &id, LocationKind::Passive, Duration::ZERO),
            LocationLookup::Invalid(InvalidReason::Stale { minimum, .. }) if minimum == later
        );

        assert_matches!(
            LocationLookup::from_payload(Bytes::from_static(b"nope"), None, &id, LocationKind::Passive, Duration::ZERO),
            LocationLookup::Invalid(InvalidReason::Suspicious(_))
        );
    }

    #[test]
    fn test_location_kind_labels() {
        let labels: Vec<_> = LocationKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels, vec!["memory", "active", "passive"]);
        assert_eq!(LocationId::from("10.0.0.4:8080").to_string(), "10.0.0.4:8080");
    }
}
