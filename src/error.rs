//! Error types for the Shelfgate access layer

use std::time::Duration;

use thiserror::Error;

use crate::upstream::Upstream;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the access layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// Caller error (4xx other than 429). Never retried.
    #[error("Invalid request to {upstream} {path}: {message}")]
    InvalidRequest {
        upstream: Upstream,
        path: String,
        status: Option<u16>,
        message: String,
    },

    /// Upstream kept answering 429 until the retry budget ran out
    #[error("{upstream} throttled {path} after {attempts} attempts (last status {last_status})")]
    Throttled {
        upstream: Upstream,
        path: String,
        attempts: u32,
        last_status: u16,
    },

    /// Repeated 5xx or network failures until the retry budget ran out
    #[error("{upstream} unavailable for {path} after {attempts} attempts: {reason}")]
    UpstreamUnavailable {
        upstream: Upstream,
        path: String,
        attempts: u32,
        last_status: Option<u16>,
        reason: String,
    },

    /// Caller deadline elapsed before a response arrived
    #[error("Request to {upstream} {path} timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        upstream: Upstream,
        path: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// Network-level failure reported by a transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request could not be built (bad header, malformed URL). Never retried.
    #[error("Malformed request: {0}")]
    Request(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Persisted store inaccessible
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Underlying SQLite error
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    // =========================================================================
    // Setup Errors
    // =========================================================================
    /// Malformed limiter/cache/upstream settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// YAML parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Last HTTP status observed, if the error carries one
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::InvalidRequest { status, .. } => *status,
            Error::Throttled { last_status, .. } => Some(*last_status),
            Error::UpstreamUnavailable { last_status, .. } => *last_status,
            _ => None,
        }
    }

    /// Upstream the error originated from, if any
    pub fn upstream(&self) -> Option<Upstream> {
        match self {
            Error::InvalidRequest { upstream, .. }
            | Error::Throttled { upstream, .. }
            | Error::UpstreamUnavailable { upstream, .. }
            | Error::Timeout { upstream, .. } => Some(*upstream),
            _ => None,
        }
    }

    /// Whether a later, independent attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Throttled { .. }
                | Error::UpstreamUnavailable { .. }
                | Error::Timeout { .. }
                | Error::Transport(_)
        )
    }

    /// Whether the error belongs to the cache layer
    pub fn is_cache_error(&self) -> bool {
        matches!(self, Error::CacheUnavailable(_) | Error::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttled_carries_context() {
        let err = Error::Throttled {
            upstream: Upstream::Audible,
            path: "/1.0/library".to_string(),
            attempts: 4,
            last_status: 429,
        };

        assert_eq!(err.status(), Some(429));
        assert_eq!(err.upstream(), Some(Upstream::Audible));
        assert!(err.is_retryable());

        let msg = err.to_string();
        assert!(msg.contains("audible"));
        assert!(msg.contains("/1.0/library"));
        assert!(msg.contains("4 attempts"));
    }

    #[test]
    fn test_invalid_request_not_retryable() {
        let err = Error::InvalidRequest {
            upstream: Upstream::Abs,
            path: "/api/items/nope".to_string(),
            status: Some(404),
            message: "Not Found".to_string(),
        };

        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_cache_errors() {
        assert!(Error::CacheUnavailable("locked".into()).is_cache_error());
        assert!(!Error::Configuration("bad".into()).is_cache_error());
        assert_eq!(Error::Configuration("bad".into()).upstream(), None);
    }
}
