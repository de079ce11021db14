//! Cache Entry Types
//!
//! Values travel between locations as a serialized [`ValueEntry`]: the payload
//! plus the UTC instant it was computed. Every location compares that creation
//! date against the caller's minimum to reject entries that were invalidated
//! after they were written.

use crate::cache::invalidation::InvalidationRule;
use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Cache Value
// =============================================================================

/// Bound satisfied by every type the cache can hold
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// =============================================================================
// Value Entry
// =============================================================================

/// A cached value stamped with its creation date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueEntry<T> {
    /// When the value was computed
    pub created_at: DateTime<Utc>,
    /// The value
    pub data: T,
}

impl<T> ValueEntry<T> {
    /// Stamp a freshly computed value with the current time
    pub fn new(data: T) -> Self {
        Self {
            created_at: Utc::now(),
            data,
        }
    }

    pub fn with_created_at(data: T, created_at: DateTime<Utc>) -> Self {
        Self { created_at, data }
    }

    /// Whether this entry predates `minimum`
    pub fn is_stale(&self, minimum: Option<DateTime<Utc>>) -> bool {
        is_stale(self.created_at, minimum)
    }
}

impl<T: Serialize> ValueEntry<T> {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> ValueEntry<T> {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Creation date of a serialized entry, read without knowing its value type
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryHeader {
    pub created_at: DateTime<Utc>,
}

impl EntryHeader {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn is_stale(&self, minimum: Option<DateTime<Utc>>) -> bool {
        is_stale(self.created_at, minimum)
    }
}

#[inline]
fn is_stale(created_at: DateTime<Utc>, minimum: Option<DateTime<Utc>>) -> bool {
    minimum.is_some_and(|min| created_at < min)
}

// =============================================================================
// Invalidation Callback
// =============================================================================

/// Entry removed from memory by an invalidation rule
#[derive(Debug, Clone)]
pub struct InvalidatedEntry {
    /// Canonical key of the evicted entry
    pub key: String,
    /// Creation date of the evicted value
    pub created_at: DateTime<Utc>,
    /// The rule that matched
    pub rule: InvalidationRule,
}

/// Async hook run for each entry evicted by an invalidation rule
pub type InvalidationCallback = Arc<dyn Fn(InvalidatedEntry) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`InvalidationCallback`]
pub fn on_invalidated<F, Fut>(callback: F) -> InvalidationCallback
where
    F: Fn(InvalidatedEntry) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |entry| Box::pin(callback(entry)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let created_at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = ValueEntry::with_created_at(vec![1, 2, 3], created_at);

        let raw = entry.to_bytes().unwrap();
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.starts_with(r#"{"createdAt":"2024-03-01T12:00:00"#));
        assert!(text.ends_with(r#","data":[1,2,3]}"#));

        let header = EntryHeader::from_slice(&raw).unwrap();
        assert_eq!(header.created_at, created_at);
    }

    #[test]
    fn test_staleness() {
        let entry = ValueEntry::new("v");
        assert!(!entry.is_stale(None));
        assert!(!entry.is_stale(Some(entry.created_at)));
        assert!(entry.is_stale(Some(entry.created_at + chrono::Duration::milliseconds(1))));
    }

    #[tokio::test]
    async fn test_callback_wrapper() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback = on_invalidated(move |entry: InvalidatedEntry| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(entry.key);
            }
        });

        callback(InvalidatedEntry {
            key: "k1".into(),
            created_at: Utc::now(),
            rule: InvalidationRule::All,
        })
        .await;
        assert_eq!(rx.recv().await.as_deref(), Some("k1"));
    }
}
