//! Error types for the smart cache
//!
//! Location-tier failures never reach callers of the public cache API: they are
//! absorbed into "try the next location". What does surface is either a
//! factory failure (shared verbatim by every caller attached to the same
//! computation), a cancellation, or an error the engine cannot recover from on
//! the authoritative path (e.g. the freshly computed value does not serialize).

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error produced by a value factory, shared by every caller awaiting the
/// same computation.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed error accepted from factories (`anyhow::Error` converts into this).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Engine Errors
    // =========================================================================
    #[error("Value factory failed: {0}")]
    Factory(SharedError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cached value for key {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),

    /// An engine failure observed by several callers of one computation
    #[error(transparent)]
    Shared(Arc<Error>),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Companion Errors
    // =========================================================================
    #[error("Companion discovery failed: {0}")]
    Discovery(String),

    #[error("Companion {location} answered {status}")]
    CompanionStatus { location: String, status: u16 },

    #[error("Companion request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Passive Store Errors
    // =========================================================================
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Passive store error: {store} - {reason}")]
    PassiveStore { store: String, reason: String },

    #[error("Compression error: {0}")]
    Compression(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a factory error so it can be shared between callers
    pub fn factory(err: impl Into<BoxError>) -> Self {
        Error::Factory(Arc::from(err.into()))
    }

    /// The factory error, if this error came from a value factory
    pub fn factory_error(&self) -> Option<&SharedError> {
        match self {
            Error::Factory(e) => Some(e),
            Error::Shared(inner) => inner.factory_error(),
            _ => None,
        }
    }

    /// Check if this error is a network-layer failure
    ///
    /// Transient failures on a companion are treated as a plain miss; anything
    /// else coming back from a companion is suspicious.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::Timeout(_) | Error::Io(_) | Error::Discovery(_) => true,
            Error::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Error::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias for the cache
pub type Result<T> = std::result::Result<T, Error>;
