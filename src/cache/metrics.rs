//! Cache Metrics
//!
//! Two layers:
//! - [`CacheMetrics`]: cache-line aligned atomic counters behind `stats()`
//! - [`MetricsRecorder`]: the duration/size recorder collaborator, with a
//!   Prometheus implementation and a no-op one

use crate::companion::notifier::NotificationKind;
use crate::error::{Error, Result};
use crate::location::LocationKind;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Fetch Outcome
// =============================================================================

/// Result of asking one location for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Hit,
    Miss,
    Invalid,
}

impl FetchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchOutcome::Hit => "hit",
            FetchOutcome::Miss => "miss",
            FetchOutcome::Invalid => "invalid",
        }
    }
}

// =============================================================================
// Per-Location Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for one location kind, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct LocationMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub invalid: AtomicU64,
    /// Bytes received on hits
    pub bytes_fetched: AtomicU64,
    /// Accumulated fetch latency in microseconds
    pub fetch_micros: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<LocationMetrics>() <= CACHE_LINE_SIZE);

impl LocationMetrics {
    #[inline]
    pub fn record(&self, outcome: FetchOutcome, elapsed: Duration, size_bytes: u64) {
        match outcome {
            FetchOutcome::Hit => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.bytes_fetched.fetch_add(size_bytes, Ordering::Relaxed);
            }
            FetchOutcome::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            FetchOutcome::Invalid => {
                self.invalid.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.fetch_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LocationMetricsSnapshot {
        LocationMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            fetch_micros: self.fetch_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LocationMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocationMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub invalid: u64,
    pub bytes_fetched: u64,
    pub fetch_micros: u64,
}

impl LocationMetricsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses + self.invalid
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Counters kept by the engine
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub memory: LocationMetrics,
    pub active: LocationMetrics,
    pub passive: LocationMetrics,
    pub factory_invocations: AtomicU64,
    pub factory_failures: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub external_misses: AtomicU64,
    pub invalidations: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn location(&self, kind: LocationKind) -> &LocationMetrics {
        match kind {
            LocationKind::Memory => &self.memory,
            LocationKind::Active => &self.active,
            LocationKind::Passive => &self.passive,
        }
    }

    pub fn record_factory(&self, success: bool) {
        self.factory_invocations.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.factory_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_notifications(&self, delivered: u64, failed: u64) {
        self.notifications_sent.fetch_add(delivered, Ordering::Relaxed);
        self.notifications_failed.fetch_add(failed, Ordering::Relaxed);
    }
}

/// Snapshot returned by `SmartCache::stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub memory: LocationMetricsSnapshot,
    pub active: LocationMetricsSnapshot,
    pub passive: LocationMetricsSnapshot,
    pub factory_invocations: u64,
    pub factory_failures: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub external_misses: u64,
    pub invalidations: u64,
    pub memory_entries: u64,
    pub memory_bytes: u64,
    pub in_flight: usize,
}

impl CacheStatsSnapshot {
    pub(crate) fn capture(
        metrics: &CacheMetrics,
        memory_entries: u64,
        memory_bytes: u64,
        in_flight: usize,
    ) -> Self {
        Self {
            memory: metrics.memory.snapshot(),
            active: metrics.active.snapshot(),
            passive: metrics.passive.snapshot(),
            factory_invocations: metrics.factory_invocations.load(Ordering::Relaxed),
            factory_failures: metrics.factory_failures.load(Ordering::Relaxed),
            notifications_sent: metrics.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: metrics.notifications_failed.load(Ordering::Relaxed),
            external_misses: metrics.external_misses.load(Ordering::Relaxed),
            invalidations: metrics.invalidations.load(Ordering::Relaxed),
            memory_entries,
            memory_bytes,
            in_flight,
        }
    }

    pub fn location(&self, kind: LocationKind) -> &LocationMetricsSnapshot {
        match kind {
            LocationKind::Memory => &self.memory,
            LocationKind::Active => &self.active,
            LocationKind::Passive => &self.passive,
        }
    }

    /// Share of lookups answered without running a factory
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.memory.hits + self.active.hits + self.passive.hits;
        let total = hits + self.factory_invocations;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Metrics Recorder
// =============================================================================

/// Duration/size recorder consumed by the engine
pub trait MetricsRecorder: Send + Sync {
    fn record_fetch(&self, kind: LocationKind, outcome: FetchOutcome, elapsed: Duration, size_bytes: u64);

    fn record_factory(&self, elapsed: Duration, success: bool);

    fn record_notification(&self, kind: NotificationKind, success: bool);
}

/// Recorder that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_fetch(&self, _: LocationKind, _: FetchOutcome, _: Duration, _: u64) {}

    fn record_factory(&self, _: Duration, _: bool) {}

    fn record_notification(&self, _: NotificationKind, _: bool) {}
}

/// Prometheus-backed recorder with its own registry
pub struct PrometheusRecorder {
    registry: Registry,
    fetch_duration: HistogramVec,
    payload_size: HistogramVec,
    lookups: IntCounterVec,
    factory_duration: HistogramVec,
    notifications: IntCounterVec,
}

impl PrometheusRecorder {
    /// Create a recorder whose metric names start with `namespace`
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();

        let fetch_duration = HistogramVec::new(
            HistogramOpts::new("fetch_duration_seconds", "Time spent fetching from a location")
                .namespace(namespace)
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["location", "outcome"],
        )
        .map_err(prom_error)?;
        let payload_size = HistogramVec::new(
            HistogramOpts::new("payload_bytes", "Serialized size of fetched values")
                .namespace(namespace)
                .buckets(prometheus::exponential_buckets(64.0, 4.0, 10).map_err(prom_error)?),
            &["location"],
        )
        .map_err(prom_error)?;
        let lookups = IntCounterVec::new(
            Opts::new("lookups_total", "Location lookups by outcome").namespace(namespace),
            &["location", "outcome"],
        )
        .map_err(prom_error)?;
        let factory_duration = HistogramVec::new(
            HistogramOpts::new("factory_duration_seconds", "Time spent computing values")
                .namespace(namespace),
            &["result"],
        )
        .map_err(prom_error)?;
        let notifications = IntCounterVec::new(
            Opts::new("notifications_total", "Companion notifications by result")
                .namespace(namespace),
            &["kind", "result"],
        )
        .map_err(prom_error)?;

        registry
            .register(Box::new(fetch_duration.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(payload_size.clone()))
            .map_err(prom_error)?;
        registry.register(Box::new(lookups.clone())).map_err(prom_error)?;
        registry
            .register(Box::new(factory_duration.clone()))
            .map_err(prom_error)?;
        registry
            .register(Box::new(notifications.clone()))
            .map_err(prom_error)?;

        Ok(Self {
            registry,
            fetch_duration,
            payload_size,
            lookups,
            factory_duration,
            notifications,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn record_fetch(&self, kind: LocationKind, outcome: FetchOutcome, elapsed: Duration, size_bytes: u64) {
        self.fetch_duration
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .observe(elapsed.as_secs_f64());
        self.lookups
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
        if outcome == FetchOutcome::Hit {
            self.payload_size
                .with_label_values(&[kind.as_str()])
                .observe(size_bytes as f64);
        }
    }

    fn record_factory(&self, elapsed: Duration, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.factory_duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    fn record_notification(&self, kind: NotificationKind, success: bool) {
        let result = if success { "delivered" } else { "failed" };
        self.notifications
            .with_label_values(&[kind.as_str(), result])
            .inc();
    }
}

fn prom_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<LocationMetrics>(), CACHE_LINE_SIZE);
        assert!(std::mem::size_of::<LocationMetrics>() <= CACHE_LINE_SIZE);
    }

    #[test]
    fn test_location_metrics() {
        let metrics = CacheMetrics::new();
        let passive = metrics.location(LocationKind::Passive);
        passive.record(FetchOutcome::Hit, Duration::from_millis(2), 100);
        passive.record(FetchOutcome::Miss, Duration::from_millis(1), 0);
        passive.record(FetchOutcome::Invalid, Duration::from_millis(1), 0);
        metrics.record_factory(true);
        metrics.record_factory(false);

        let snapshot = CacheStatsSnapshot::capture(&metrics, 3, 300, 1);
        let passive = snapshot.location(LocationKind::Passive);
        assert_eq!(passive.hits, 1);
        assert_eq!(passive.misses, 1);
        assert_eq!(passive.invalid, 1);
        assert_eq!(passive.bytes_fetched, 100);
        assert_eq!(passive.fetch_micros, 4000);
        assert!((passive.hit_ratio() - 0.333).abs() < 0.01);
        assert_eq!(snapshot.factory_invocations, 2);
        assert_eq!(snapshot.factory_failures, 1);
        assert!((snapshot.hit_ratio() - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_prometheus_rendering() {
        let recorder = PrometheusRecorder::new("smartcache").unwrap();
        recorder.record_fetch(LocationKind::Active, FetchOutcome::Hit, Duration::from_millis(3), 512);
        recorder.record_factory(Duration::from_millis(10), true);
        recorder.record_notification(NotificationKind::Invalidation, false);

        let text = recorder.render().unwrap();
        assert!(text.contains("smartcache_lookups_total{location=\"active\",outcome=\"hit\"} 1"));
        assert!(text.contains("smartcache_notifications_total{kind=\"invalidation\",result=\"failed\"} 1"));
        assert!(text.contains("smartcache_factory_duration_seconds_count{result=\"ok\"} 1"));
    }
}
