//! Redis Passive Store
//!
//! [`PassiveStore`] over a multiplexed Redis connection. The connection
//! manager reconnects on its own; every call clones the cheap handle.

use super::passive::PassiveStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::fmt;
use std::time::Duration;

/// Configuration for the Redis store
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL (e.g. "redis://127.0.0.1:6379")
    pub url: String,
    /// Location name reported in logs, metrics and events
    pub name: String,
    /// Time allowed for the initial connection
    pub connection_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            name: "redis".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Redis-backed passive store
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout(config.connection_timeout))??;

        tracing::info!(name = %config.name, "Connected to Redis");
        Ok(Self { connection, config })
    }

    fn store_error(&self, operation: &str, key: &str, e: redis::RedisError) -> Error {
        Error::PassiveStore {
            store: self.config.name.clone(),
            reason: format!("{} '{}' failed: {}", operation, key, e),
        }
    }
}

#[async_trait]
impl PassiveStore for RedisStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| self.store_error("GET", key, e))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let ttl_secs = ttl.as_secs().max(1);
                let _: () = conn
                    .set_ex(key, value.as_ref(), ttl_secs)
                    .await
                    .map_err(|e| self.store_error("SETEX", key, e))?;
            }
            None => {
                let _: () = conn
                    .set(key, value.as_ref())
                    .await
                    .map_err(|e| self.store_error("SET", key, e))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = conn
            .del(key)
            .await
            .map_err(|e| self.store_error("DEL", key, e))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RedisStoreConfig::new("redis://cache:6379")
            .with_name("shared-redis")
            .with_connection_timeout(Duration::from_secs(2));
        assert_eq!(config.url, "redis://cache:6379");
        assert_eq!(config.name, "shared-redis");
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let err = RedisStore::connect(RedisStoreConfig::new("not a url")).await.unwrap_err();
        assert!(matches!(err, Error::Redis(_)));
    }
}
