//! # Wardstream Error
//!
//! Unified error types for the wardstream workspace. Every network-facing
//! component (stream transport, telemetry sink, storage) reports failures
//! through [`WardstreamError`] so that retry policy can be decided in one
//! place.
//!
//! ## Error Categories
//!
//! - transient network failures (retryable)
//! - server responses: 5xx, 429 and 408 (retryable)
//! - client responses: other 4xx (never retried)
//! - heartbeat timeouts (routed through the reconnect path)
//! - circuit-open rejections (fail fast, distinct from network failures)
//! - exhausted retries (terminal)
//! - persistence quota errors (recovered locally)
//!
//! ## Example
//!
//! ```
//! use wardstream_error::{WardstreamError, ErrorCode};
//!
//! let err = WardstreamError::from_status(503, "upstream unavailable");
//! assert!(err.is_retryable());
//! assert_eq!(err.code(), ErrorCode::Server);
//!
//! let err = WardstreamError::from_status(404, "no such ward");
//! assert!(!err.is_retryable());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

/// The main error type for wardstream operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WardstreamError {
    // ============ Network Errors ============
    /// Connection reset, DNS failure, generic fetch failure, timeout
    #[error("Network error: {message}")]
    TransientNetwork {
        /// Error description
        message: String,
        /// Low-level error code (e.g. `ECONNRESET`), if known
        code: Option<String>,
    },

    /// Request timed out
    #[error("Request timed out after {millis}ms")]
    Timeout {
        /// Elapsed time before giving up
        millis: u64,
    },

    // ============ HTTP Errors ============
    /// Server-side failure (5xx, 408)
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Rate limited by the server (429)
    #[error("Rate limited (429), retry after {retry_after_secs:?}s")]
    RateLimited {
        /// Value of the `Retry-After` header, if present
        retry_after_secs: Option<u64>,
    },

    /// Client-side failure (non-retryable 4xx)
    #[error("Client error {status}: {message}")]
    Client {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    // ============ Stream Errors ============
    /// No heartbeat arrived within the staleness window
    #[error("Heartbeat timeout: no heartbeat for {elapsed_ms}ms")]
    HeartbeatTimeout {
        /// Time since the last heartbeat (or since open)
        elapsed_ms: u64,
    },

    /// Stream ended or was closed by the server
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// Malformed event payload
    #[error("Malformed event '{event}': {reason}")]
    MalformedEvent {
        /// Event type on the wire
        event: String,
        /// Parse failure description
        reason: String,
    },

    // ============ Resilience Errors ============
    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit breaker is OPEN for '{name}', retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Breaker name
        name: String,
        /// Time until the breaker will admit a probe call
        retry_after_ms: u64,
    },

    /// Retries exhausted
    #[error("Max retries exceeded ({attempts}) for '{key}': {last_error}")]
    MaxRetriesExceeded {
        /// Retry key
        key: String,
        /// Number of retries performed
        attempts: u32,
        /// Message of the last failure
        last_error: String,
    },

    // ============ Persistence Errors ============
    /// Storage quota exceeded while persisting
    #[error("Persistence quota exceeded: {0}")]
    PersistenceQuota(String),

    /// Other storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    // ============ Parsing / Config ============
    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ============ Generic ============
    /// Unknown/other error
    #[error("{0}")]
    Other(String),

    /// Wrapped error from an external source
    #[error("External error: {message}")]
    External {
        /// Error message
        message: String,
    },
}

/// Convenient Result type using WardstreamError
pub type Result<T> = std::result::Result<T, WardstreamError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| WardstreamError::External {
            message: format!("{}: {}", ctx.into(), e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| WardstreamError::External {
            message: format!("{}: {}", f(), e),
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| WardstreamError::Other(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| WardstreamError::Other(f()))
    }
}

// ============ From implementations for common error types ============

impl From<std::io::Error> for WardstreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => WardstreamError::Timeout { millis: 0 },
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => WardstreamError::TransientNetwork {
                message: err.to_string(),
                code: None,
            },
            _ => WardstreamError::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for WardstreamError {
    fn from(err: serde_json::Error) -> Self {
        WardstreamError::Json(err.to_string())
    }
}

impl From<url::ParseError> for WardstreamError {
    fn from(err: url::ParseError) -> Self {
        WardstreamError::InvalidUrl(err.to_string())
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Transient network error
    TransientNetwork = 1001,
    /// Timeout
    Timeout = 1002,
    /// Server error
    Server = 2001,
    /// Rate limited
    RateLimited = 2002,
    /// Client error
    Client = 2003,
    /// Heartbeat timeout
    HeartbeatTimeout = 3001,
    /// Stream closed
    StreamClosed = 3002,
    /// Malformed event
    MalformedEvent = 3003,
    /// Circuit open
    CircuitOpen = 4001,
    /// Max retries exceeded
    MaxRetriesExceeded = 4002,
    /// Persistence quota
    PersistenceQuota = 5001,
    /// Storage failure
    Storage = 5002,
    /// Configuration error
    Config = 9001,
}

impl WardstreamError {
    /// Builds the right variant for an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => WardstreamError::RateLimited {
                retry_after_secs: None,
            },
            408 | 500..=599 => WardstreamError::Server { status, message },
            _ => WardstreamError::Client { status, message },
        }
    }

    /// Shorthand for a transient network failure.
    pub fn network(message: impl Into<String>) -> Self {
        WardstreamError::TransientNetwork {
            message: message.into(),
            code: None,
        }
    }

    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            WardstreamError::TransientNetwork { .. } => ErrorCode::TransientNetwork,
            WardstreamError::Timeout { .. } => ErrorCode::Timeout,
            WardstreamError::Server { .. } => ErrorCode::Server,
            WardstreamError::RateLimited { .. } => ErrorCode::RateLimited,
            WardstreamError::Client { .. } => ErrorCode::Client,
            WardstreamError::HeartbeatTimeout { .. } => ErrorCode::HeartbeatTimeout,
            WardstreamError::StreamClosed(_) => ErrorCode::StreamClosed,
            WardstreamError::MalformedEvent { .. } => ErrorCode::MalformedEvent,
            WardstreamError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            WardstreamError::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            WardstreamError::PersistenceQuota(_) => ErrorCode::PersistenceQuota,
            WardstreamError::Storage(_) => ErrorCode::Storage,
            WardstreamError::Config(_) | WardstreamError::InvalidUrl(_) => ErrorCode::Config,
            _ => ErrorCode::Unknown,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            WardstreamError::Server { status, .. } | WardstreamError::Client { status, .. } => {
                Some(*status)
            }
            WardstreamError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WardstreamError::TransientNetwork { .. }
                | WardstreamError::Timeout { .. }
                | WardstreamError::Server { .. }
                | WardstreamError::RateLimited { .. }
                | WardstreamError::HeartbeatTimeout { .. }
                | WardstreamError::StreamClosed(_)
        )
    }

    /// Returns true for errors that must reach the caller unchanged
    /// instead of being retried or recovered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WardstreamError::MaxRetriesExceeded { .. } | WardstreamError::Client { .. }
        )
    }

    /// Returns suggested retry delay in seconds, if applicable
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            WardstreamError::RateLimited { retry_after_secs } => retry_after_secs.or(Some(5)),
            WardstreamError::CircuitOpen { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000))
            }
            _ if self.is_retryable() => Some(1),
            _ => None,
        }
    }
}
