//! Cache Companions
//!
//! A companion is a peer process running the same engine. The
//! [`CacheCompanion`] turns the current peer set into active locations and
//! event notifiers, and carries this node's own identity plus its passive
//! locations.
//!
//! - [`LocalCompanion`]: no peers (single process or passive-only)
//! - [`HttpCompanion`]: any [`PeerDiscovery`] combined with the HTTP transport

pub mod discovery;
pub mod notifier;

pub use discovery::{DnsDiscovery, EndpointsDiscovery, PeerDiscovery, StaticDiscovery};
pub use notifier::{
    broadcast_cache_miss, broadcast_invalidation, CacheEventNotifier, HttpEventNotifier,
    NotificationFailure, NotificationKind, NotificationReport,
};

use crate::config::{CompanionConfig, DiscoveryConfig};
use crate::error::{Error, Result};
use crate::location::{ActiveCacheLocation, CacheLocation, LocationId, PassiveCacheLocation};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Wire Paths
// =============================================================================

/// Paths of the companion wire protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionPaths {
    /// Root every segment is mounted under
    pub root: String,
    pub get: String,
    pub cache_miss: String,
    pub invalidate: String,
}

impl Default for CompanionPaths {
    fn default() -> Self {
        Self {
            root: "/smartcache".to_string(),
            get: "get".to_string(),
            cache_miss: "cachemiss".to_string(),
            invalidate: "invalidate".to_string(),
        }
    }
}

impl CompanionPaths {
    fn join(&self, segment: &str) -> String {
        format!("{}/{}", self.root.trim_end_matches('/'), segment)
    }

    pub fn get_path(&self) -> String {
        self.join(&self.get)
    }

    pub fn cache_miss_path(&self) -> String {
        self.join(&self.cache_miss)
    }

    pub fn invalidate_path(&self) -> String {
        self.join(&self.invalidate)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.starts_with('/') {
            return Err(Error::Configuration(format!(
                "companion root path '{}' must start with '/'",
                self.root
            )));
        }
        let segments = [
            ("get", &self.get),
            ("cache_miss", &self.cache_miss),
            ("invalidate", &self.invalidate),
        ];
        for (name, segment) in segments {
            if segment.trim().is_empty() || segment.contains('/') {
                return Err(Error::Configuration(format!(
                    "companion path segment '{}' is invalid: '{}'",
                    name, segment
                )));
            }
        }
        if self.get == self.cache_miss || self.get == self.invalidate || self.cache_miss == self.invalidate {
            return Err(Error::Configuration(
                "companion path segments must be distinct".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CacheCompanion Trait
// =============================================================================

/// Topology of the companion fleet, as seen from this process
#[async_trait]
pub trait CacheCompanion: Send + Sync {
    /// Identity other companions know this process by
    fn self_location_id(&self) -> &LocationId;

    /// Active locations for the current peers, excluding this process
    ///
    /// `None` returns every peer; `Some` restricts the result to peers whose
    /// id is among the candidates.
    async fn active_locations(
        &self,
        candidates: Option<&HashSet<LocationId>>,
    ) -> Result<Vec<Arc<dyn CacheLocation>>>;

    /// One notifier per current peer, excluding this process
    async fn event_notifiers(&self) -> Result<Vec<Arc<dyn CacheEventNotifier>>>;

    /// Shared stores, in lookup order
    fn passive_locations(&self) -> &[Arc<PassiveCacheLocation>];
}

// =============================================================================
// Local Companion
// =============================================================================

/// Companion with no peers
pub struct LocalCompanion {
    id: LocationId,
    passive: Vec<Arc<PassiveCacheLocation>>,
}

impl LocalCompanion {
    pub fn new(passive: Vec<Arc<PassiveCacheLocation>>) -> Self {
        Self {
            id: LocationId::from("local"),
            passive,
        }
    }
}

impl Default for LocalCompanion {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl CacheCompanion for LocalCompanion {
    fn self_location_id(&self) -> &LocationId {
        &self.id
    }

    async fn active_locations(
        &self,
        _candidates: Option<&HashSet<LocationId>>,
    ) -> Result<Vec<Arc<dyn CacheLocation>>> {
        Ok(Vec::new())
    }

    async fn event_notifiers(&self) -> Result<Vec<Arc<dyn CacheEventNotifier>>> {
        Ok(Vec::new())
    }

    fn passive_locations(&self) -> &[Arc<PassiveCacheLocation>] {
        &self.passive
    }
}

// =============================================================================
// HTTP Companion
// =============================================================================

/// Peers found by a [`PeerDiscovery`], reached over HTTP
pub struct HttpCompanion {
    self_id: LocationId,
    self_addr: Option<SocketAddr>,
    discovery: Arc<dyn PeerDiscovery>,
    client: Client,
    config: CompanionConfig,
    passive: Vec<Arc<PassiveCacheLocation>>,
}

impl HttpCompanion {
    pub fn new(
        self_addr: Option<SocketAddr>,
        discovery: Arc<dyn PeerDiscovery>,
        config: CompanionConfig,
        passive: Vec<Arc<PassiveCacheLocation>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let self_id = self_addr.map(LocationId::from).unwrap_or_else(|| LocationId::from("local"));
        if self_addr.is_none() {
            warn!(
                env = %config.self_ip_env,
                "Own address unknown, this process may query itself"
            );
        }
        info!(
            self_id = %self_id,
            discovery = %discovery.describe(),
            scheme = config.scheme(),
            "Companion configured"
        );
        Ok(Self {
            self_id,
            self_addr,
            discovery,
            client,
            config,
            passive,
        })
    }

    fn url(&self, addr: SocketAddr, path: &str) -> String {
        format!("{}://{}{}", self.config.scheme(), addr, path)
    }

    /// Current peers without this process
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        let mut peers = self.discovery.discover().await?;
        peers.retain(|addr| Some(*addr) != self.self_addr);
        debug!(peers = peers.len(), discovery = %self.discovery.describe(), "Discovered companions");
        Ok(peers)
    }
}

#[async_trait]
impl CacheCompanion for HttpCompanion {
    fn self_location_id(&self) -> &LocationId {
        &self.self_id
    }

    async fn active_locations(
        &self,
        candidates: Option<&HashSet<LocationId>>,
    ) -> Result<Vec<Arc<dyn CacheLocation>>> {
        let get_path = self.config.paths.get_path();
        let locations = self
            .peers()
            .await?
            .into_iter()
            .map(|addr| (LocationId::from(addr), addr))
            .filter(|(id, _)| candidates.map_or(true, |c| c.contains(id)))
            .map(|(id, addr)| {
                Arc::new(ActiveCacheLocation::new(
                    id,
                    self.client.clone(),
                    self.url(addr, &get_path),
                    self.config.request_timeout(),
                )) as Arc<dyn CacheLocation>
            })
            .collect();
        Ok(locations)
    }

    async fn event_notifiers(&self) -> Result<Vec<Arc<dyn CacheEventNotifier>>> {
        let cache_miss_path = self.config.paths.cache_miss_path();
        let invalidate_path = self.config.paths.invalidate_path();
        let notifiers = self
            .peers()
            .await?
            .into_iter()
            .map(|addr| {
                Arc::new(HttpEventNotifier::new(
                    LocationId::from(addr),
                    self.client.clone(),
                    self.url(addr, &cache_miss_path),
                    self.url(addr, &invalidate_path),
                    self.config.request_timeout(),
                )) as Arc<dyn CacheEventNotifier>
            })
            .collect();
        Ok(notifiers)
    }

    fn passive_locations(&self) -> &[Arc<PassiveCacheLocation>] {
        &self.passive
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Own address from the configured environment variable and port
pub fn self_addr_from_env(config: &CompanionConfig) -> Option<SocketAddr> {
    let raw = std::env::var(&config.self_ip_env).ok()?;
    match raw.trim().parse::<IpAddr>() {
        Ok(ip) => Some(SocketAddr::new(ip, config.port)),
        Err(e) => {
            warn!(env = %config.self_ip_env, value = %raw, error = %e, "Ignoring unparsable own address");
            None
        }
    }
}

/// Build the companion described by the configuration
pub async fn build_companion(
    config: &CompanionConfig,
    self_addr: Option<SocketAddr>,
    passive: Vec<Arc<PassiveCacheLocation>>,
) -> Result<Arc<dyn CacheCompanion>> {
    let discovery: Arc<dyn PeerDiscovery> = match &config.discovery {
        DiscoveryConfig::None => return Ok(Arc::new(LocalCompanion::new(passive))),
        DiscoveryConfig::Dns { name } => Arc::new(DnsDiscovery::new(name.clone(), config.port)),
        DiscoveryConfig::Static { peers } => Arc::new(StaticDiscovery::new(peers.iter().copied())),
        DiscoveryConfig::Endpoints { namespace, service } => {
            let client = kube::Client::try_default().await?;
            Arc::new(EndpointsDiscovery::new(
                client,
                namespace.clone(),
                service.clone(),
                config.port,
            ))
        }
    };
    Ok(Arc::new(HttpCompanion::new(
        self_addr,
        discovery,
        config.clone(),
        passive,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDiscovery;

    #[async_trait]
    impl PeerDiscovery for FailingDiscovery {
        async fn discover(&self) -> Result<Vec<SocketAddr>> {
            Err(Error::Discovery("no such host".into()))
        }

        fn describe(&self) -> String {
            "failing".into()
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn companion(discovery: Arc<dyn PeerDiscovery>) -> HttpCompanion {
        HttpCompanion::new(
            Some(addr("10.0.0.1:8080")),
            discovery,
            CompanionConfig::default(),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_paths() {
        let paths = CompanionPaths::default();
        assert_eq!(paths.get_path(), "/smartcache/get");
        assert_eq!(paths.cache_miss_path(), "/smartcache/cachemiss");
        assert_eq!(paths.invalidate_path(), "/smartcache/invalidate");

        let root = CompanionPaths {
            root: "/".into(),
            ..Default::default()
        };
        assert_eq!(root.get_path(), "/get");
        root.validate().unwrap();

        let nested = CompanionPaths {
            get: "a/b".into(),
            ..Default::default()
        };
        assert!(nested.validate().is_err());

        let relative = CompanionPaths {
            root: "cache".into(),
            ..Default::default()
        };
        assert!(relative.validate().is_err());
    }

    #[tokio::test]
    async fn test_excludes_self_and_filters_candidates() {
        let discovery = Arc::new(StaticDiscovery::new(vec![
            addr("10.0.0.1:8080"),
            addr("10.0.0.2:8080"),
            addr("10.0.0.3:8080"),
        ]));
        let companion = companion(discovery);
        assert_eq!(companion.self_location_id().as_str(), "10.0.0.1:8080");

        let all = companion.active_locations(None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|l| l.id().to_string()).collect();
        assert_eq!(ids, vec!["10.0.0.2:8080", "10.0.0.3:8080"]);

        let candidates: HashSet<_> = [LocationId::from("10.0.0.3:8080"), LocationId::from("10.0.0.9:8080")]
            .into_iter()
            .collect();
        let known = companion.active_locations(Some(&candidates)).await.unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].id().as_str(), "10.0.0.3:8080");

        let notifiers = companion.event_notifiers().await.unwrap();
        let ids: Vec<_> = notifiers.iter().map(|n| n.location_id().to_string()).collect();
        assert_eq!(ids, vec!["10.0.0.2:8080", "10.0.0.3:8080"]);
    }

    #[tokio::test]
    async fn test_discovery_failure_propagates() {
        let companion = companion(Arc::new(FailingDiscovery));
        assert!(matches!(
            companion.active_locations(None).await,
            Err(Error::Discovery(_))
        ));
        assert!(companion.event_notifiers().await.is_err());
    }

    #[tokio::test]
    async fn test_build_local_and_static() {
        let local = build_companion(&CompanionConfig::default(), None, Vec::new())
            .await
            .unwrap();
        assert_eq!(local.self_location_id().as_str(), "local");
        assert!(local.event_notifiers().await.unwrap().is_empty());

        let config = CompanionConfig {
            discovery: DiscoveryConfig::Static {
                peers: vec![addr("10.0.0.1:8080"), addr("10.0.0.2:8080")],
            },
            ..Default::default()
        };
        let fleet = build_companion(&config, Some(addr("10.0.0.2:8080")), Vec::new())
            .await
            .unwrap();
        let notifiers = fleet.event_notifiers().await.unwrap();
        assert_eq!(notifiers.len(), 1);
        assert_eq!(notifiers[0].location_id().as_str(), "10.0.0.1:8080");
    }
}
