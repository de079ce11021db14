//! Smart Cache Node
//!
//! Runs one member of a smart-cache fleet: the companion wire protocol,
//! health and metrics endpoints, and a small demo API that reads through the
//! cache.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      smart-cache-node                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  /smartcache/{get,cachemiss,invalidate}   companion protocol │
//! │  /healthz  /readyz  /metrics  /stats      operations         │
//! │  /demo/:name                              read-through demo  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smart_cache::{
    CompanionServer, CompanionServerConfig, DiscoveryConfig, Error, NamedKey, PassiveBackend,
    PrometheusRecorder, SmartCache, SmartCacheConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Smart Cache Node - multi-location cache with companion peers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP bind address (companion protocol, health, metrics)
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// YAML configuration file
    #[arg(long, env = "SMARTCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// DNS name resolving to every companion (headless service)
    #[arg(long, env = "COMPANION_DNS_NAME")]
    dns_name: Option<String>,

    /// Fixed companion addresses
    #[arg(long, env = "COMPANION_PEERS", value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    /// Environment variable holding this process' own IP
    #[arg(long, env = "SELF_IP_ENV")]
    self_ip_env: Option<String>,

    /// Redis URL of the passive store
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Reach companions over https
    #[arg(long, env = "COMPANION_USE_HTTPS")]
    use_https: bool,

    /// Root path of the companion protocol
    #[arg(long, env = "COMPANION_ROOT_PATH")]
    root_path: Option<String>,

    /// Timeout of outbound companion calls in milliseconds
    #[arg(long, env = "COMPANION_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;

    info!("Starting Smart Cache node");
    info!("  Version: {}", smart_cache::VERSION);
    info!("  Bind: {}", args.bind);
    info!("  Discovery: {:?}", config.companion.discovery);
    info!("  Passive backend: {:?}", config.passive.backend);

    let recorder = Arc::new(PrometheusRecorder::new("smartcache")?);
    let cache = SmartCache::from_config(&config, recorder.clone())
        .await
        .context("building cache")?;

    let state = AppState {
        cache: Arc::clone(&cache),
        recorder,
    };
    let host = Router::new()
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/demo/:name", get(demo_get).delete(demo_remove))
        .with_state(state);

    let server = Arc::new(
        CompanionServer::new(
            CompanionServerConfig::from_companion(&config.companion, Some(args.bind)),
            Arc::clone(&cache),
        )
        .with_routes(host),
    );

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    let handle = server.spawn(listener);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown signal received");
    server.shutdown();

    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Companion server error: {}", e),
        Err(e) => error!("Companion server task failed: {}", e),
    }
    cache.flush_background().await;

    info!("Node shutdown complete");
    Ok(())
}

/// File configuration overridden by CLI flags / environment
fn load_config(args: &Args) -> anyhow::Result<SmartCacheConfig> {
    let mut config = match &args.config {
        Some(path) => SmartCacheConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SmartCacheConfig::default(),
    };

    config.companion.port = args.bind.port();
    if let Some(name) = &args.dns_name {
        config.companion.discovery = DiscoveryConfig::Dns { name: name.clone() };
    } else if !args.peers.is_empty() {
        config.companion.discovery = DiscoveryConfig::Static {
            peers: args.peers.clone(),
        };
    }
    if let Some(env) = &args.self_ip_env {
        config.companion.self_ip_env = env.clone();
    }
    if let Some(url) = &args.redis_url {
        config.passive.backend = PassiveBackend::Redis { url: url.clone() };
    }
    if args.use_https {
        config.companion.use_https = true;
    }
    if let Some(root) = &args.root_path {
        config.companion.paths.root = root.clone();
    }
    if let Some(timeout) = args.request_timeout_ms {
        config.companion.request_timeout_ms = timeout;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Host Routes
// =============================================================================

#[derive(Clone)]
struct AppState {
    cache: Arc<SmartCache>,
    recorder: Arc<PrometheusRecorder>,
}

/// Ready once companions can be discovered
async fn readiness(State(state): State<AppState>) -> Response {
    match state.cache.companion().event_notifiers().await {
        Ok(_) => (StatusCode::OK, "ok").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.recorder.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeting {
    name: String,
    message: String,
    computed_at: chrono::DateTime<chrono::Utc>,
}

/// Read-through demo: the greeting is computed once per fleet
async fn demo_get(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let key = NamedKey::new("demo", name.clone());
    let factory = move || async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok::<_, anyhow::Error>(Greeting {
            message: format!("Hello, {}!", name),
            name,
            computed_at: chrono::Utc::now(),
        })
    };

    match state.cache.get(key, factory, &CancellationToken::new()).await {
        Ok(greeting) => Json(greeting).into_response(),
        Err(e) => error_response(e),
    }
}

async fn demo_remove(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    let report = state.cache.remove(&NamedKey::new("demo", name)).await;
    Json(serde_json::json!({
        "evicted": report.evicted.len(),
        "passiveDeleted": report.passive_deleted,
        "notified": report.notification.as_ref().map(|n| n.delivered.len()).unwrap_or(0),
        "discoveryError": report.discovery_error,
    }))
}

fn error_response(e: Error) -> Response {
    let status = if e.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE
    } else if e.factory_error().is_some() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, e.to_string()).into_response()
}
