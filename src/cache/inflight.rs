//! In-Flight Computations
//!
//! Per-key registry of pending resolutions. The first caller for a key
//! spawns the resolution and stores a shared future; later callers attach to
//! it. The spawned task removes its own slot before its result becomes
//! visible, so a caller arriving after settlement either finds the value in
//! memory or starts a fresh resolution.
//!
//! Cancellation follows [`CancellationPolicy`]:
//!
//! - `ContinueWhileAwaited`: the resolution owns its token and is cancelled
//!   when the last attached caller goes away
//! - `FollowInitiator`: the token is a child of the initiating caller's token

use crate::config::CancellationPolicy;
use crate::error::{Error, SharedError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Resolution
// =============================================================================

/// A value resolved for a key, shared by every attached caller
pub struct Resolved {
    /// Materialized value
    pub value: Arc<dyn Any + Send + Sync>,
    /// Serialized `ValueEntry`
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("created_at", &self.created_at)
            .field("size_bytes", &self.payload.len())
            .finish()
    }
}

/// Why a resolution produced no value
#[derive(Debug, Clone)]
pub enum ComputeFailure {
    /// The factory failed; every caller receives the same error object
    Factory(SharedError),
    Cancelled,
    Engine(Arc<Error>),
}

impl From<ComputeFailure> for Error {
    fn from(failure: ComputeFailure) -> Self {
        match failure {
            ComputeFailure::Factory(e) => Error::Factory(e),
            ComputeFailure::Cancelled => Error::Cancelled,
            ComputeFailure::Engine(e) => Error::Shared(e),
        }
    }
}

pub type Resolution = Result<Arc<Resolved>, ComputeFailure>;

type SharedResolution = Shared<BoxFuture<'static, Resolution>>;

// =============================================================================
// Registry
// =============================================================================

struct Flight {
    id: u64,
    future: SharedResolution,
    waiters: usize,
    token: CancellationToken,
}

/// A caller attached to a flight
pub struct Attachment {
    pub future: SharedResolution,
    pub guard: WaiterGuard,
    /// True when this caller started the resolution
    pub initiated: bool,
}

/// Map from canonical key to its pending resolution
pub struct InFlightRegistry {
    flights: DashMap<String, Flight>,
    next_id: AtomicU64,
    policy: CancellationPolicy,
}

impl InFlightRegistry {
    pub fn new(policy: CancellationPolicy) -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    pub fn policy(&self) -> CancellationPolicy {
        self.policy
    }

    /// Attach to the pending resolution for `key`, or start one with `start`
    ///
    /// `start` receives the token the resolution must observe. A flight whose
    /// token was already cancelled is replaced rather than joined.
    pub fn join<S>(self: &Arc<Self>, key: &str, caller: &CancellationToken, start: S) -> Attachment
    where
        S: FnOnce(CancellationToken) -> BoxFuture<'static, Resolution>,
    {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().token.is_cancelled() => {
                let flight = occupied.get_mut();
                flight.waiters += 1;
                debug!(key = %key, waiters = flight.waiters, "Attached to in-flight resolution");
                Attachment {
                    future: flight.future.clone(),
                    guard: WaiterGuard::new(self, key, flight.id),
                    initiated: false,
                }
            }
            entry => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let token = match self.policy {
                    CancellationPolicy::ContinueWhileAwaited => CancellationToken::new(),
                    CancellationPolicy::FollowInitiator => caller.child_token(),
                };

                let resolution = start(token.clone());
                let registry = Arc::clone(self);
                let settle_key = key.to_string();
                let handle = tokio::spawn(async move {
                    let outcome = resolution.await;
                    registry.settle(&settle_key, id);
                    outcome
                });
                let future = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(ComputeFailure::Engine(Arc::new(Error::Internal(format!(
                            "resolution task failed: {}",
                            e
                        ))))),
                    }
                }
                .boxed()
                .shared();

                let flight = Flight {
                    id,
                    future: future.clone(),
                    waiters: 1,
                    token,
                };
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(flight);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(flight);
                    }
                }
                debug!(key = %key, flight = id, "Started resolution");

                Attachment {
                    future,
                    guard: WaiterGuard::new(self, key, id),
                    initiated: true,
                }
            }
        }
    }

    /// Number of keys currently resolving
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    fn settle(&self, key: &str, id: u64) {
        self.flights.remove_if(key, |_, flight| flight.id == id);
    }

    fn detach(&self, key: &str, id: u64) {
        let Some(mut flight) = self.flights.get_mut(key) else {
            return;
        };
        if flight.id != id {
            return;
        }
        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 && self.policy == CancellationPolicy::ContinueWhileAwaited {
            debug!(key = %key, flight = id, "Last caller left, cancelling resolution");
            flight.token.cancel();
        }
    }
}

/// Detaches a caller from its flight when dropped
pub struct WaiterGuard {
    registry: Arc<InFlightRegistry>,
    key: String,
    id: u64,
}

impl WaiterGuard {
    fn new(registry: &Arc<InFlightRegistry>, key: &str, id: u64) -> Self {
        Self {
            registry: Arc::clone(registry),
            key: key.to_string(),
            id,
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.registry.detach(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn resolved(value: &str) -> Arc<Resolved> {
        Arc::new(Resolved {
            value: Arc::new(value.to_string()),
            payload: Bytes::new(),
            created_at: Utc::now(),
        })
    }

    fn slow(value: &'static str, runs: Arc<AtomicUsize>) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Resolution> {
        move |token| {
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => Ok(resolved(value)),
                    _ = token.cancelled() => Err(ComputeFailure::Cancelled),
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_second_caller_attaches() {
        let registry = Arc::new(InFlightRegistry::new(CancellationPolicy::ContinueWhileAwaited));
        let runs = Arc::new(AtomicUsize::new(0));
        let caller = CancellationToken::new();

        let first = registry.join("k", &caller, slow("a", runs.clone()));
        let second = registry.join("k", &caller, slow("b", runs.clone()));
        assert!(first.initiated);
        assert!(!second.initiated);
        assert_eq!(registry.len(), 1);

        let (a, b) = tokio::join!(first.future, second.future);
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.value.downcast_ref::<String>().unwrap(), "a");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_last_waiter_leaving_cancels() {
        let registry = Arc::new(InFlightRegistry::new(CancellationPolicy::ContinueWhileAwaited));
        let runs = Arc::new(AtomicUsize::new(0));
        let caller = CancellationToken::new();

        let first = registry.join("k", &caller, slow("a", runs.clone()));
        let second = registry.join("k", &caller, slow("b", runs.clone()));
        let future = first.future.clone();

        drop(first);
        assert!(registry.contains("k"));
        drop(second);

        assert!(matches!(future.await, Err(ComputeFailure::Cancelled)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_follow_initiator_cancels_with_initiator() {
        let registry = Arc::new(InFlightRegistry::new(CancellationPolicy::FollowInitiator));
        let runs = Arc::new(AtomicUsize::new(0));
        let initiator = CancellationToken::new();
        let other = CancellationToken::new();

        let first = registry.join("k", &initiator, slow("a", runs.clone()));
        let second = registry.join("k", &other, slow("b", runs.clone()));
        initiator.cancel();

        assert!(matches!(second.future.await, Err(ComputeFailure::Cancelled)));
        drop(first);

        // A cancelled flight is replaced, not joined
        let third = registry.join("k", &other, slow("c", runs.clone()));
        assert!(third.initiated);
        assert_eq!(third.future.await.unwrap().value.downcast_ref::<String>().unwrap(), "c");
    }

    #[test]
    fn test_failure_conversion() {
        let err: Error = ComputeFailure::Cancelled.into();
        assert!(err.is_cancelled());

        let shared: SharedError = Arc::new(std::io::Error::other("boom"));
        let err: Error = ComputeFailure::Factory(shared.clone()).into();
        assert!(Arc::ptr_eq(err.factory_error().unwrap(), &shared));
    }
}
