//! Error types for outbound calls

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for outbound-guard
pub type Result<T> = std::result::Result<T, Error>;

/// Outbound call errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Circuit breaker refused the call
    #[error("Circuit open for {key}")]
    CircuitOpen {
        /// Call key whose circuit is open
        key: String,
    },

    /// Waiting for rate-limit budget exceeded the hard wait budget
    #[error("Rate limit wait for {key} exceeded {}s", waited.as_secs())]
    RateLimitTimeout {
        /// Call key that was waiting
        key: String,
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// Rate limit reached and the caller asked not to wait
    #[error("Rate limit reached for {key}, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Call key that was refused
        key: String,
        /// Earliest time after which a call may be admitted
        retry_after: Duration,
    },

    /// Transport error, optionally carrying an HTTP status code
    #[error("Transport error{}: {message}", status.map(|s| format!(" {s}")).unwrap_or_default())]
    Transport {
        /// HTTP-like status code, when the remote answered
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// State store error
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a transport error with a status code
    pub fn transport_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create a transport error without a status code
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// HTTP-like status code carried by this error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this error is a circuit-open refusal
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this error is a rate-limit wait timeout
    #[must_use]
    pub fn is_rate_limit_timeout(&self) -> bool {
        matches!(self, Self::RateLimitTimeout { .. })
    }

    /// Whether the call was refused locally without reaching the remote
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimitTimeout { .. } | Self::RateLimited { .. }
        )
    }
}
