//! Cache Configuration
//!
//! Serde-deserialisable settings for every layer of the cache. A node loads
//! them from an optional YAML file and the binary overrides individual fields
//! from CLI flags / environment variables.

use crate::cache::compression::CompressionConfig;
use crate::companion::CompanionPaths;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Root Configuration
// =============================================================================

/// Complete configuration of a cache node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartCacheConfig {
    /// Local memory tier
    pub memory: MemoryTierConfig,
    /// Engine behaviour (cancellation, peer lookup, invalidation log)
    pub engine: EngineConfig,
    /// Companion discovery and wire protocol
    pub companion: CompanionConfig,
    /// Passive shared store
    pub passive: PassiveStoreConfig,
}

impl SmartCacheConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory.capacity_bytes == 0 {
            return Err(Error::Configuration(
                "memory.capacity_bytes must be greater than zero".into(),
            ));
        }
        if self.memory.shard_count == 0 {
            return Err(Error::Configuration(
                "memory.shard_count must be greater than zero".into(),
            ));
        }
        if self.memory.default_ttl_secs == Some(0) {
            return Err(Error::Configuration(
                "memory.default_ttl_secs must be greater than zero when set".into(),
            ));
        }
        if self.engine.event_channel_capacity == 0 {
            return Err(Error::Configuration(
                "engine.event_channel_capacity must be greater than zero".into(),
            ));
        }
        if self.companion.request_timeout_ms == 0 {
            return Err(Error::Configuration(
                "companion.request_timeout_ms must be greater than zero".into(),
            ));
        }
        self.companion.paths.validate()?;

        if let DiscoveryConfig::Dns { name } = &self.companion.discovery {
            if name.trim().is_empty() {
                return Err(Error::Configuration("companion DNS name is empty".into()));
            }
        }
        if let PassiveBackend::Redis { url } = &self.passive.backend {
            if url.trim().is_empty() {
                return Err(Error::Configuration("passive Redis URL is empty".into()));
            }
        }
        if self.passive.ttl_secs == Some(0) {
            return Err(Error::Configuration(
                "passive.ttl_secs must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Memory Tier
// =============================================================================

/// Bounds of the in-process memory tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// Maximum total serialized size held in memory
    pub capacity_bytes: u64,
    /// Number of independently locked shards
    pub shard_count: usize,
    /// Default time-to-live for entries (None = until evicted)
    pub default_ttl_secs: Option<u64>,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024, // 256 MB
            shard_count: 16,
            default_ttl_secs: Some(600),
        }
    }
}

impl MemoryTierConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// What happens to a shared computation when callers cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Keep computing until every attached caller has cancelled or gone away
    #[default]
    ContinueWhileAwaited,
    /// Cancel the computation as soon as the caller that started it cancels
    FollowInitiator,
}

/// Which companions are asked for a key before falling back to passive stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerLookup {
    /// Only companions that announced a value for the key
    #[default]
    KnownHolders,
    /// Every discovered companion
    AllCompanions,
}

/// Engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cancellation: CancellationPolicy,
    pub peer_lookup: PeerLookup,
    /// How long applied invalidation rules keep rejecting older values
    pub invalidation_retention_secs: u64,
    /// Write computed values through to passive stores
    pub write_passive: bool,
    /// Capacity of the cache event broadcast channel
    pub event_channel_capacity: usize,
    /// Upper bound on keys tracked in the known-holder directory
    pub max_tracked_keys: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancellation: CancellationPolicy::default(),
            peer_lookup: PeerLookup::default(),
            invalidation_retention_secs: 3600,
            write_passive: true,
            event_channel_capacity: 1024,
            max_tracked_keys: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn invalidation_retention(&self) -> Duration {
        Duration::from_secs(self.invalidation_retention_secs)
    }
}

// =============================================================================
// Companion
// =============================================================================

/// How peers are found
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    /// No peers (single process or passive-only deployment)
    #[default]
    None,
    /// Resolve a (headless service) DNS name on every fan-out
    Dns { name: String },
    /// Fixed peer list
    Static { peers: Vec<SocketAddr> },
    /// Read the address set of a Kubernetes Endpoints object
    Endpoints {
        namespace: String,
        service: String,
    },
}

/// Companion discovery and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub discovery: DiscoveryConfig,
    /// Wire protocol paths served by every companion
    pub paths: CompanionPaths,
    /// Port companions listen on
    pub port: u16,
    /// Reach peers over https
    pub use_https: bool,
    /// Timeout of every outbound companion call
    pub request_timeout_ms: u64,
    /// Environment variable holding this process' own address
    pub self_ip_env: String,
    /// Largest request body the wire middleware accepts
    pub max_body_bytes: usize,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            paths: CompanionPaths::default(),
            port: 8080,
            use_https: false,
            request_timeout_ms: 1000,
            self_ip_env: "POD_IP".to_string(),
            max_body_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl CompanionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_https {
            "https"
        } else {
            "http"
        }
    }
}

// =============================================================================
// Passive Store
// =============================================================================

/// Passive store backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassiveBackend {
    #[default]
    None,
    /// In-process map (tests, standalone nodes)
    InMemory,
    Redis { url: String },
}

/// Passive store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveStoreConfig {
    pub backend: PassiveBackend,
    /// Prepended to every canonical key
    pub key_prefix: String,
    /// Expiry of written entries (None = no expiry)
    pub ttl_secs: Option<u64>,
    pub compression: CompressionConfig,
    /// Connection timeout for network backends
    pub connect_timeout_secs: u64,
}

impl Default for PassiveStoreConfig {
    fn default() -> Self {
        Self {
            backend: PassiveBackend::default(),
            key_prefix: "smartcache:".to_string(),
            ttl_secs: Some(3600),
            compression: CompressionConfig::default(),
            connect_timeout_secs: 5,
        }
    }
}

impl PassiveStoreConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SmartCacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.cancellation, CancellationPolicy::ContinueWhileAwaited);
        assert_eq!(config.engine.peer_lookup, PeerLookup::KnownHolders);
        assert_eq!(config.companion.paths.get_path(), "/smartcache/get");
        assert_eq!(config.companion.scheme(), "http");
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
memory:
  capacity_bytes: 1048576
engine:
  cancellation: follow_initiator
  peer_lookup: all_companions
companion:
  discovery:
    type: dns
    name: cache-headless.default.svc.cluster.local
  use_https: true
passive:
  backend:
    type: redis
    url: redis://redis:6379
  ttl_secs: 120
"#;
        let config = SmartCacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.memory.capacity_bytes, 1024 * 1024);
        assert_eq!(config.memory.shard_count, 16);
        assert_eq!(config.engine.cancellation, CancellationPolicy::FollowInitiator);
        assert_eq!(config.engine.peer_lookup, PeerLookup::AllCompanions);
        assert_eq!(
            config.companion.discovery,
            DiscoveryConfig::Dns {
                name: "cache-headless.default.svc.cluster.local".into()
            }
        );
        assert_eq!(config.companion.scheme(), "https");
        assert_eq!(config.passive.ttl(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = SmartCacheConfig::default();
        config.memory.capacity_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = SmartCacheConfig::default();
        config.companion.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SmartCacheConfig::default();
        config.companion.paths.cache_miss = config.companion.paths.get.clone();
        assert!(config.validate().is_err());

        let mut config = SmartCacheConfig::default();
        config.companion.discovery = DiscoveryConfig::Dns { name: " ".into() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "memory:\n  shard_count: 4\n").unwrap();

        let config = SmartCacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.memory.shard_count, 4);
    }
}
