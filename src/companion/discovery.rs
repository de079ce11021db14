//! Peer Discovery
//!
//! Discovery is pull-based: the companion re-resolves the peer set on every
//! fan-out and keeps no registry. A peer that disappears just starts failing
//! lookups until the source (DNS, Endpoints) converges.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use kube::Client;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Source of the current peer address set
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Current peer addresses (may include this process)
    async fn discover(&self) -> Result<Vec<SocketAddr>>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

fn dedup(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    addrs.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

// =============================================================================
// DNS
// =============================================================================

/// Resolves a (headless service) DNS name to every companion's address
#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    name: String,
    port: u16,
}

impl DnsDiscovery {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

#[async_trait]
impl PeerDiscovery for DnsDiscovery {
    async fn discover(&self) -> Result<Vec<SocketAddr>> {
        let resolved = tokio::net::lookup_host((self.name.as_str(), self.port))
            .await
            .map_err(|e| Error::Discovery(format!("resolving {} failed: {}", self.name, e)))?;
        let peers = dedup(resolved);
        debug!(name = %self.name, peers = peers.len(), "Resolved companions");
        Ok(peers)
    }

    fn describe(&self) -> String {
        format!("dns({}:{})", self.name, self.port)
    }
}

// =============================================================================
// Static
// =============================================================================

/// Fixed peer list
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            peers: dedup(peers),
        }
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.peers.clone())
    }

    fn describe(&self) -> String {
        format!("static({} peers)", self.peers.len())
    }
}

// =============================================================================
// Kubernetes Endpoints
// =============================================================================

/// Reads ready addresses of a Kubernetes Endpoints object
#[derive(Clone)]
pub struct EndpointsDiscovery {
    client: Client,
    namespace: String,
    service: String,
    port: u16,
}

impl EndpointsDiscovery {
    pub fn new(client: Client, namespace: impl Into<String>, service: impl Into<String>, port: u16) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service: service.into(),
            port,
        }
    }

    fn endpoints_api(&self) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Ready addresses of an Endpoints object
    pub fn addresses(endpoints: &Endpoints, port: u16) -> Vec<SocketAddr> {
        let addrs = endpoints
            .subsets
            .iter()
            .flatten()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .filter_map(|address| address.ip.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, port));
        dedup(addrs)
    }
}

#[async_trait]
impl PeerDiscovery for EndpointsDiscovery {
    async fn discover(&self) -> Result<Vec<SocketAddr>> {
        let endpoints = self.endpoints_api().get(&self.service).await.map_err(|e| {
            Error::Discovery(format!(
                "reading endpoints {}/{} failed: {}",
                self.namespace, self.service, e
            ))
        })?;
        Ok(Self::addresses(&endpoints, self.port))
    }

    fn describe(&self) -> String {
        format!("endpoints({}/{})", self.namespace, self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    #[tokio::test]
    async fn test_static_discovery_dedups() {
        let a: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:8080".parse().unwrap();
        let discovery = StaticDiscovery::new(vec![b, a, b]);

        assert_eq!(discovery.discover().await.unwrap(), vec![a, b]);
        assert_eq!(discovery.describe(), "static(2 peers)");
    }

    #[tokio::test]
    async fn test_dns_discovery_resolves_localhost() {
        let discovery = DnsDiscovery::new("localhost", 8080);
        let peers = discovery.discover().await.unwrap();
        assert!(!peers.is_empty());
        assert!(peers.iter().all(|addr| addr.port() == 8080 && addr.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_dns_failure_is_a_discovery_error() {
        let discovery = DnsDiscovery::new("companions.invalid", 8080);
        let err = discovery.discover().await.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
    }

    #[test]
    fn test_endpoint_addresses() {
        let address = |ip: &str| EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        };
        let endpoints = Endpoints {
            subsets: Some(vec![
                EndpointSubset {
                    addresses: Some(vec![address("10.1.0.5"), address("10.1.0.4")]),
                    ..Default::default()
                },
                EndpointSubset {
                    addresses: Some(vec![address("10.1.0.5"), address("garbage")]),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let addrs = EndpointsDiscovery::addresses(&endpoints, 9000);
        assert_eq!(
            addrs,
            vec![
                "10.1.0.4:9000".parse::<SocketAddr>().unwrap(),
                "10.1.0.5:9000".parse::<SocketAddr>().unwrap(),
            ]
        );
    }
}
