//! Retry classification
//!
//! Decides which failures are worth retrying. [`DefaultRetryClassifier`]
//! works on any displayable error by inspecting its message, which is what
//! `execute` falls back to when no `should_retry` is supplied.
//! [`TypedRetryClassifier`] uses the structured [`WardstreamError`] taxonomy.

use std::fmt;
use std::time::Duration;
use wardstream_error::WardstreamError;

/// Trait for classifying errors as retryable or not
pub trait RetryClassifier<E> {
    /// Check if the error is retryable
    fn is_retryable(&self, error: &E) -> bool;

    /// Get suggested delay override for this error (if any)
    fn suggested_delay(&self, error: &E) -> Option<Duration>;
}

/// Network error codes that indicate a transient socket failure
pub const RETRYABLE_NETWORK_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
];

/// Message fragments of transient failures (matched case-insensitively)
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "failed to fetch",
    "load failed",
    "network error",
    "chunk load error",
    "loading chunk",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
];

/// Fragments that are never retried, even if a transient pattern also matches
const PERMANENT_PATTERNS: &[&str] = &["syntaxerror", "syntax error", "unexpected token"];

/// Message-based retry classifier
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryClassifier;

impl DefaultRetryClassifier {
    /// Classifies an error message.
    pub fn is_message_retryable(message: &str) -> bool {
        let lower = message.to_lowercase();

        if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
            return false;
        }

        if Self::status_in(message).is_some_and(HttpRetryClassifier::is_status_retryable) {
            return true;
        }

        let upper = message.to_uppercase();
        if RETRYABLE_NETWORK_CODES.iter().any(|c| upper.contains(c)) {
            return true;
        }

        TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
    }

    /// True for the transient socket codes
    pub fn is_code_retryable(code: &str) -> bool {
        RETRYABLE_NETWORK_CODES
            .iter()
            .any(|c| c.eq_ignore_ascii_case(code))
    }

    /// First standalone three-digit number in `message` within the HTTP
    /// status range.
    fn status_in(message: &str) -> Option<u16> {
        message
            .split(|c: char| !c.is_ascii_digit())
            .filter(|token| token.len() == 3)
            .filter_map(|token| token.parse::<u16>().ok())
            .find(|status| (100..600).contains(status))
    }
}

impl<E: fmt::Display> RetryClassifier<E> for DefaultRetryClassifier {
    fn is_retryable(&self, error: &E) -> bool {
        Self::is_message_retryable(&error.to_string())
    }

    fn suggested_delay(&self, error: &E) -> Option<Duration> {
        let msg = error.to_string().to_lowercase();

        // Rate limiting usually needs longer delays
        if msg.contains("429") || msg.contains("rate limit") {
            return Some(Duration::from_secs(5));
        }

        None
    }
}

/// HTTP-specific retry classifier
#[derive(Debug, Clone, Default)]
pub struct HttpRetryClassifier;

impl HttpRetryClassifier {
    /// Check if HTTP status code is retryable: 408, 429 and every 5xx
    pub fn is_status_retryable(status: u16) -> bool {
        matches!(status, 408 | 429 | 500..=599)
    }

    /// Check if status indicates rate limiting
    pub fn is_rate_limited(status: u16) -> bool {
        status == 429
    }

    /// Check if a failed batch should be dropped rather than retried
    pub fn is_status_permanent(status: u16) -> bool {
        (400..500).contains(&status) && !Self::is_status_retryable(status)
    }

    /// Get retry delay from Retry-After header value
    pub fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Classifier for [`WardstreamError`]
#[derive(Debug, Clone, Default)]
pub struct TypedRetryClassifier;

impl RetryClassifier<WardstreamError> for TypedRetryClassifier {
    fn is_retryable(&self, error: &WardstreamError) -> bool {
        error.is_retryable()
    }

    fn suggested_delay(&self, error: &WardstreamError) -> Option<Duration> {
        match error {
            WardstreamError::RateLimited { .. } => error.retry_after().map(Duration::from_secs),
            _ => None,
        }
    }
}

/// `should_retry` predicate for [`WardstreamError`], usable with
/// `RetryOptions::with_should_retry`.
pub fn typed_should_retry(error: &WardstreamError, _attempt: u32) -> bool {
    TypedRetryClassifier.is_retryable(error)
}
