//! Companion Wire Protocol
//!
//! All requests are `POST` with a UTF-8 JSON body wrapped in a
//! [`PayloadHolder`] envelope:
//!
//! | Path (under the configured root) | Body | Response |
//! |---|---|---|
//! | `get` | [`KeyRequest`] | 200 + stored `ValueEntry` JSON, or 404 |
//! | `cachemiss` | [`CacheMissDescriptor`] | 200 |
//! | `invalidate` | [`InvalidationDescriptor`] | 200 |
//!
//! Malformed bodies are answered with 400.

pub mod middleware;
pub mod server;

pub use middleware::{companion_middleware, CompanionRoutes};
pub use server::{CompanionServer, CompanionServerConfig};

use crate::cache::invalidation::InvalidationRule;
use crate::error::Result;
use crate::location::LocationId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Response header carrying the stored value's type name on `get`
pub const TYPE_HEADER: &str = "x-smartcache-type";

// =============================================================================
// Envelope
// =============================================================================

/// Envelope around every request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadHolder<T> {
    pub payload: T,
}

impl<T> PayloadHolder<T> {
    pub fn new(payload: T) -> Self {
        Self { payload }
    }

    pub fn into_inner(self) -> T {
        self.payload
    }
}

impl<T: Serialize> PayloadHolder<T> {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> PayloadHolder<T> {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Body of a `get` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequest {
    /// Canonical key
    pub key: String,
}

/// A companion computed (or stored) a value for `key`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMissDescriptor {
    /// Canonical key
    pub key: String,
    /// Companion now holding the value
    pub location_id: LocationId,
    /// Creation date of that value
    pub created_at: DateTime<Utc>,
}

/// A companion applied an invalidation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationDescriptor {
    pub rule: InvalidationRule,
    pub issued_at: DateTime<Utc>,
    /// Companion that issued the rule
    pub origin: LocationId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let body = PayloadHolder::new(KeyRequest { key: "users:1".into() });
        let raw = body.to_bytes().unwrap();
        assert_eq!(&raw[..], br#"{"payload":{"key":"users:1"}}"#);

        let miss: PayloadHolder<CacheMissDescriptor> = PayloadHolder::from_slice(
            br#"{"payload":{"key":"k","locationId":"10.0.0.2:8080","createdAt":"2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(miss.payload.location_id, LocationId::from("10.0.0.2:8080"));

        let invalidation: PayloadHolder<InvalidationDescriptor> = PayloadHolder::from_slice(
            br#"{"payload":{"rule":{"type":"prefix","prefix":"users:"},"issuedAt":"2024-01-01T00:00:00Z","origin":"a"}}"#,
        )
        .unwrap();
        assert_eq!(invalidation.into_inner().rule, InvalidationRule::prefix("users:"));
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(PayloadHolder::<KeyRequest>::from_slice(br#"{"key":"k"}"#).is_err());
        assert!(PayloadHolder::<KeyRequest>::from_slice(b"not json").is_err());
    }
}
