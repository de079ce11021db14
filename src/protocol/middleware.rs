//! Companion Middleware
//!
//! Serves the wire protocol in front of any host router. Requests that are
//! not a `POST` to one of the three companion paths reach the host's own
//! routes untouched.

use crate::cache::SmartCache;
use crate::companion::CompanionPaths;
use crate::config::CompanionConfig;
use crate::protocol::{CacheMissDescriptor, InvalidationDescriptor, KeyRequest, PayloadHolder, TYPE_HEADER};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderName, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Get,
    CacheMiss,
    Invalidate,
}

/// State of the companion middleware
#[derive(Clone)]
pub struct CompanionRoutes {
    cache: Arc<SmartCache>,
    get_path: String,
    cache_miss_path: String,
    invalidate_path: String,
    max_body_bytes: usize,
}

impl CompanionRoutes {
    pub fn new(cache: Arc<SmartCache>, paths: &CompanionPaths, max_body_bytes: usize) -> Self {
        Self {
            cache,
            get_path: paths.get_path(),
            cache_miss_path: paths.cache_miss_path(),
            invalidate_path: paths.invalidate_path(),
            max_body_bytes,
        }
    }

    pub fn from_config(cache: Arc<SmartCache>, config: &CompanionConfig) -> Self {
        Self::new(cache, &config.paths, config.max_body_bytes)
    }

    /// Put the wire protocol in front of `router`
    ///
    /// A 404 fallback is installed first so the middleware also sees requests
    /// the host router has no route for.
    pub fn apply(self, router: Router) -> Router {
        router
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(self, companion_middleware))
    }

    fn route(&self, path: &str) -> Option<Route> {
        if path == self.get_path {
            Some(Route::Get)
        } else if path == self.cache_miss_path {
            Some(Route::CacheMiss)
        } else if path == self.invalidate_path {
            Some(Route::Invalidate)
        } else {
            None
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Intercept `POST {root}/get`, `{root}/cachemiss` and `{root}/invalidate`
pub async fn companion_middleware(State(routes): State<CompanionRoutes>, request: Request, next: Next) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }
    let Some(route) = routes.route(request.uri().path()) else {
        return next.run(request).await;
    };

    let body = match axum::body::to_bytes(request.into_body(), routes.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            warn!(route = ?route, error = %e, "Rejected companion request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    match route {
        Route::Get => handle_get(&routes.cache, &body),
        Route::CacheMiss => match decode::<CacheMissDescriptor>(route, &body) {
            Ok(descriptor) => {
                routes.cache.add_external_miss(descriptor);
                StatusCode::OK.into_response()
            }
            Err(response) => response,
        },
        Route::Invalidate => match decode::<InvalidationDescriptor>(route, &body) {
            Ok(descriptor) => {
                let evicted = routes.cache.apply_external_invalidation(descriptor);
                debug!(evicted = evicted.len(), "Applied companion invalidation");
                StatusCode::OK.into_response()
            }
            Err(response) => response,
        },
    }
}

fn handle_get(cache: &SmartCache, body: &Bytes) -> Response {
    let request = match decode::<KeyRequest>(Route::Get, body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match cache.try_get_direct_from_memory(&request.key) {
        Some(read) => {
            debug!(key = %request.key, size_bytes = read.payload.len(), "Served value to companion");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/json"),
                    (HeaderName::from_static(TYPE_HEADER), read.type_name),
                ],
                Body::from(read.payload),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn decode<T: DeserializeOwned>(route: Route, body: &[u8]) -> std::result::Result<T, Response> {
    PayloadHolder::<T>::from_slice(body)
        .map(PayloadHolder::into_inner)
        .map_err(|e| {
            warn!(route = ?route, error = %e, "Malformed companion request");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{GetOptions, InvalidationRule, NamedKey, ValueEntry};
    use crate::location::LocationId;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use chrono::{Duration as ChronoDuration, Utc};
    use tower::ServiceExt;

    fn app(cache: &Arc<SmartCache>) -> Router {
        let host = Router::new().route("/smartcache/get", get(|| async { "host get" }));
        CompanionRoutes::new(Arc::clone(cache), &CompanionPaths::default(), 1024).apply(host)
    }

    fn post(path: &str, body: impl Into<Body>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn read_body(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_serves_memory_only() {
        let cache = SmartCache::new();
        let request = || post("/smartcache/get", r#"{"payload":{"key":"users:1"}}"#);

        let response = app(&cache).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        cache
            .set(NamedKey::new("users", "1"), "Ada".to_string(), GetOptions::default())
            .unwrap();
        let response = app(&cache).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(TYPE_HEADER).unwrap(),
            std::any::type_name::<String>()
        );

        let entry: ValueEntry<String> = ValueEntry::from_slice(&read_body(response).await).unwrap();
        assert_eq!(entry.data, "Ada");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let cache = SmartCache::new();
        for path in ["/smartcache/get", "/smartcache/cachemiss", "/smartcache/invalidate"] {
            let response = app(&cache).oneshot(post(path, r#"{"key":"k"}"#)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", path);
        }

        let response = app(&cache)
            .oneshot(post("/smartcache/get", vec![b'x'; 4096]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_cache_miss_records_holder() {
        let cache = SmartCache::new();
        let descriptor = PayloadHolder::new(CacheMissDescriptor {
            key: "users:1".into(),
            location_id: LocationId::from("10.0.0.9:8080"),
            created_at: Utc::now(),
        });

        let response = app(&cache)
            .oneshot(post("/smartcache/cachemiss", descriptor.to_bytes().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_evicts_locally() {
        let cache = SmartCache::new();
        cache
            .set(NamedKey::new("users", "1"), 1u64, GetOptions::default())
            .unwrap();
        cache
            .set(NamedKey::new("orders", "1"), 2u64, GetOptions::default())
            .unwrap();

        let descriptor = PayloadHolder::new(InvalidationDescriptor {
            rule: InvalidationRule::prefix("users:"),
            issued_at: Utc::now() + ChronoDuration::seconds(1),
            origin: LocationId::from("10.0.0.9:8080"),
        });
        let response = app(&cache)
            .oneshot(post("/smartcache/invalidate", descriptor.to_bytes().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(cache.try_get_direct_from_memory("users:1").is_none());
        assert!(cache.try_get_direct_from_memory("orders:1").is_some());
    }

    #[tokio::test]
    async fn test_other_requests_pass_through() {
        let cache = SmartCache::new();

        let response = app(&cache)
            .oneshot(HttpRequest::builder().uri("/smartcache/get").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&read_body(response).await[..], b"host get");

        let response = app(&cache).oneshot(post("/elsewhere", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
