//! Companion Server
//!
//! HTTP listener that serves the companion wire protocol plus `/healthz`,
//! in front of optional host routes (metrics, application endpoints).

use crate::cache::SmartCache;
use crate::companion::CompanionPaths;
use crate::config::CompanionConfig;
use crate::error::{Error, Result};
use crate::protocol::CompanionRoutes;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the companion server
#[derive(Debug, Clone)]
pub struct CompanionServerConfig {
    /// Bind address
    pub bind_addr: SocketAddr,
    /// Wire protocol paths
    pub paths: CompanionPaths,
    /// Max request body size
    pub max_body_bytes: usize,
}

impl Default for CompanionServerConfig {
    fn default() -> Self {
        Self::from_companion(&CompanionConfig::default(), None)
    }
}

impl CompanionServerConfig {
    /// Listen on `bind_addr`, or on every interface at the companion port
    pub fn from_companion(config: &CompanionConfig, bind_addr: Option<SocketAddr>) -> Self {
        Self {
            bind_addr: bind_addr.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))),
            paths: config.paths.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serves one cache node to its companions
pub struct CompanionServer {
    config: CompanionServerConfig,
    cache: Arc<SmartCache>,
    host: Router,
    shutdown_tx: broadcast::Sender<()>,
}

impl CompanionServer {
    pub fn new(config: CompanionServerConfig, cache: Arc<SmartCache>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            cache,
            host: Router::new(),
            shutdown_tx,
        }
    }

    /// Host routes served next to the wire protocol
    pub fn with_routes(mut self, host: Router) -> Self {
        self.host = host;
        self
    }

    pub fn config(&self) -> &CompanionServerConfig {
        &self.config
    }

    /// Complete application: host routes, `/healthz`, wire protocol, tracing
    pub fn router(&self) -> Router {
        let routes = CompanionRoutes::new(
            Arc::clone(&self.cache),
            &self.config.paths,
            self.config.max_body_bytes,
        );
        routes
            .apply(self.host.clone().route("/healthz", get(health_check)))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind companion server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            root = %self.config.paths.root,
            "Companion server listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Companion server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Companion server error: {}", e)))?;

        Ok(())
    }

    /// Serve on `listener` in a background task
    pub fn spawn(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<Result<()>> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.serve(listener).await })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{GetOptions, NamedKey};
    use crate::protocol::{KeyRequest, PayloadHolder};
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = CompanionServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.bind_addr.ip().is_unspecified());
        assert_eq!(config.paths.root, "/smartcache");
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let cache = SmartCache::new();
        cache
            .set(NamedKey::new("users", "1"), "Ada".to_string(), GetOptions::default())
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(CompanionServer::new(CompanionServerConfig::default(), cache));
        let handle = server.spawn(listener);

        let client = reqwest::Client::new();
        let health = client.get(format!("http://{}/healthz", addr)).send().await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
        assert_eq!(health.text().await.unwrap(), "ok");

        let response = client
            .post(format!("http://{}/smartcache/get", addr))
            .json(&PayloadHolder::new(KeyRequest { key: "users:1".into() }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        server.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
        outcome.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = CompanionServerConfig {
            bind_addr: taken.local_addr().unwrap(),
            ..Default::default()
        };
        let server = CompanionServer::new(config, SmartCache::new());

        let err = server.run().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
