//! Active Cache Location
//!
//! A companion process asked over HTTP whether it holds a key in memory.
//! Network-layer failures (connection refused, timeout) are plain misses: the
//! peer may simply be gone. Any other unexpected answer is reported as
//! suspicious so the engine stops treating the peer as a holder.

use super::{CacheLocation, InvalidReason, LocationId, LocationKind, LocationLookup};
use crate::cache::key::KeyHolder;
use crate::protocol::{KeyRequest, PayloadHolder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A companion reached over the wire protocol's `get` path
pub struct ActiveCacheLocation {
    id: LocationId,
    client: Client,
    get_url: String,
    timeout: Duration,
}

impl ActiveCacheLocation {
    pub fn new(id: LocationId, client: Client, get_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id,
            client,
            get_url: get_url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.get_url
    }

    async fn fetch(&self, key: &KeyHolder, minimum: Option<DateTime<Utc>>) -> LocationLookup {
        let started = Instant::now();
        let body = PayloadHolder::new(KeyRequest {
            key: key.storage_key().to_string(),
        });

        let response = match self
            .client
            .post(&self.get_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!(key = %key, location = %self.id, error = %e, "Companion unreachable");
                return LocationLookup::Miss;
            }
            Err(e) => {
                return LocationLookup::Invalid(InvalidReason::Suspicious(format!(
                    "request failed: {}",
                    e
                )))
            }
        };

        match response.status() {
            StatusCode::NOT_FOUND => return LocationLookup::Miss,
            status if !status.is_success() => {
                return LocationLookup::Invalid(InvalidReason::Suspicious(format!(
                    "companion answered {}",
                    status
                )))
            }
            _ => {}
        }

        match response.bytes().await {
            Ok(payload) => LocationLookup::from_payload(
                payload,
                minimum,
                &self.id,
                LocationKind::Active,
                started.elapsed(),
            ),
            Err(e) if e.is_timeout() => LocationLookup::Miss,
            Err(e) => LocationLookup::Invalid(InvalidReason::Suspicious(format!(
                "body read failed: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl CacheLocation for ActiveCacheLocation {
    fn id(&self) -> &LocationId {
        &self.id
    }

    fn kind(&self) -> LocationKind {
        LocationKind::Active
    }

    async fn get(
        &self,
        key: &KeyHolder,
        minimum_creation_date: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> LocationLookup {
        tokio::select! {
            lookup = self.fetch(key, minimum_creation_date) => lookup,
            _ = cancel.cancelled() => LocationLookup::Miss,
        }
    }
}
