//! Cache Event Notifiers
//!
//! Each notifier targets exactly one companion. Broadcasting fans out to all
//! of them concurrently and waits for the whole batch; one companion's
//! failure is recorded in the report and never affects delivery to others.

use crate::error::{Error, Result};
use crate::location::LocationId;
use crate::protocol::{CacheMissDescriptor, InvalidationDescriptor, PayloadHolder};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Kind of notification sent to companions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CacheMiss,
    Invalidation,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::CacheMiss => "cache_miss",
            NotificationKind::Invalidation => "invalidation",
        }
    }
}

/// Delivers cache events to one companion
#[async_trait]
pub trait CacheEventNotifier: Send + Sync {
    /// Companion this notifier targets
    fn location_id(&self) -> &LocationId;

    async fn notify_cache_miss(&self, descriptor: &CacheMissDescriptor) -> Result<()>;

    async fn notify_invalidation(&self, descriptor: &InvalidationDescriptor) -> Result<()>;
}

// =============================================================================
// HTTP Notifier
// =============================================================================

/// Posts descriptors to a companion's `cachemiss` / `invalidate` paths
pub struct HttpEventNotifier {
    id: LocationId,
    client: Client,
    cache_miss_url: String,
    invalidate_url: String,
    timeout: Duration,
}

impl HttpEventNotifier {
    pub fn new(
        id: LocationId,
        client: Client,
        cache_miss_url: impl Into<String>,
        invalidate_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            client,
            cache_miss_url: cache_miss_url.into(),
            invalidate_url: invalidate_url.into(),
            timeout,
        }
    }

    async fn post<T: Serialize + Sync>(&self, url: &str, payload: &T) -> Result<()> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&PayloadHolder::new(payload))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.timeout)
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::CompanionStatus {
                location: self.id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheEventNotifier for HttpEventNotifier {
    fn location_id(&self) -> &LocationId {
        &self.id
    }

    async fn notify_cache_miss(&self, descriptor: &CacheMissDescriptor) -> Result<()> {
        self.post(&self.cache_miss_url, descriptor).await
    }

    async fn notify_invalidation(&self, descriptor: &InvalidationDescriptor) -> Result<()> {
        self.post(&self.invalidate_url, descriptor).await
    }
}

// =============================================================================
// Broadcast
// =============================================================================

/// Delivery to one companion that failed
#[derive(Debug, Clone)]
pub struct NotificationFailure {
    pub location: LocationId,
    pub error: String,
}

/// Outcome of one broadcast
#[derive(Debug, Clone)]
pub struct NotificationReport {
    pub kind: NotificationKind,
    pub delivered: Vec<LocationId>,
    pub failed: Vec<NotificationFailure>,
}

impl NotificationReport {
    pub fn empty(kind: NotificationKind) -> Self {
        Self {
            kind,
            delivered: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

async fn broadcast<'a, F, Fut>(
    notifiers: &'a [Arc<dyn CacheEventNotifier>],
    kind: NotificationKind,
    send: F,
) -> NotificationReport
where
    F: Fn(&'a Arc<dyn CacheEventNotifier>) -> Fut,
    Fut: Future<Output = Result<()>> + 'a,
{
    let outcomes = join_all(notifiers.iter().map(|notifier| {
        let sent = send(notifier);
        async move { (notifier.location_id().clone(), sent.await) }
    }))
    .await;

    let mut report = NotificationReport::empty(kind);
    for (location, outcome) in outcomes {
        match outcome {
            Ok(()) => report.delivered.push(location),
            Err(e) => {
                warn!(location = %location, kind = kind.as_str(), error = %e, "Companion notification failed");
                report.failed.push(NotificationFailure {
                    location,
                    error: e.to_string(),
                });
            }
        }
    }
    debug!(
        kind = kind.as_str(),
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Broadcast complete"
    );
    report
}

/// Tell every companion that a value was computed for a key
pub async fn broadcast_cache_miss(
    notifiers: &[Arc<dyn CacheEventNotifier>],
    descriptor: &CacheMissDescriptor,
) -> NotificationReport {
    broadcast(notifiers, NotificationKind::CacheMiss, |n| {
        n.notify_cache_miss(descriptor)
    })
    .await
}

/// Tell every companion to apply an invalidation rule
pub async fn broadcast_invalidation(
    notifiers: &[Arc<dyn CacheEventNotifier>],
    descriptor: &InvalidationDescriptor,
) -> NotificationReport {
    broadcast(notifiers, NotificationKind::Invalidation, |n| {
        n.notify_invalidation(descriptor)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::invalidation::InvalidationRule;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct RecordingNotifier {
        id: LocationId,
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: LocationId::from(id),
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CacheEventNotifier for RecordingNotifier {
        fn location_id(&self) -> &LocationId {
            &self.id
        }

        async fn notify_cache_miss(&self, descriptor: &CacheMissDescriptor) -> Result<()> {
            if self.fail {
                return Err(Error::Timeout(Duration::from_millis(10)));
            }
            self.seen.lock().push(descriptor.key.clone());
            Ok(())
        }

        async fn notify_invalidation(&self, descriptor: &InvalidationDescriptor) -> Result<()> {
            if self.fail {
                return Err(Error::Discovery("gone".into()));
            }
            self.seen.lock().push(descriptor.rule.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let a = RecordingNotifier::new("a", true);
        let b = RecordingNotifier::new("b", false);
        let c = RecordingNotifier::new("c", false);
        let notifiers: Vec<Arc<dyn CacheEventNotifier>> = vec![a.clone(), b.clone(), c.clone()];

        let report = broadcast_cache_miss(
            &notifiers,
            &CacheMissDescriptor {
                key: "k1".into(),
                location_id: LocationId::from("self"),
                created_at: Utc::now(),
            },
        )
        .await;

        assert!(!report.all_delivered());
        assert_eq!(report.attempted(), 3);
        assert_eq!(report.delivered, vec![LocationId::from("b"), LocationId::from("c")]);
        assert_eq!(report.failed[0].location, LocationId::from("a"));
        assert_eq!(b.seen.lock().as_slice(), ["k1".to_string()]);
        assert_eq!(c.seen.lock().as_slice(), ["k1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidation_broadcast() {
        let a = RecordingNotifier::new("a", false);
        let notifiers: Vec<Arc<dyn CacheEventNotifier>> = vec![a.clone()];

        let report = broadcast_invalidation(
            &notifiers,
            &InvalidationDescriptor {
                rule: InvalidationRule::prefix("users:"),
                issued_at: Utc::now(),
                origin: LocationId::from("self"),
            },
        )
        .await;

        assert!(report.all_delivered());
        assert_eq!(report.kind, NotificationKind::Invalidation);
        assert_eq!(a.seen.lock().as_slice(), ["prefix(users:)".to_string()]);
    }

    #[tokio::test]
    async fn test_http_notifier_reports_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let notifier = HttpEventNotifier::new(
            LocationId::from(addr),
            Client::new(),
            format!("http://{}/smartcache/cachemiss", addr),
            format!("http://{}/smartcache/invalidate", addr),
            Duration::from_millis(500),
        );
        let err = notifier
            .notify_cache_miss(&CacheMissDescriptor {
                key: "k".into(),
                location_id: LocationId::from("self"),
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
