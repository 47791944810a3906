//! # Wardstream Resilience
//!
//! Retry and circuit-breaking primitives shared by the wardstream stream
//! client and telemetry queue.
//!
//! - **Exponential Backoff**: keyed retry records, jittered delays and an
//!   `execute` loop with pluggable retry decisions
//! - **Adaptive Backoff**: multiplier tuned from a rolling window of outcomes
//! - **Circuit Breaker**: three-state breaker wrapping either strategy
//! - **Retry Classification**: message, HTTP status and typed-error classifiers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wardstream_resilience::{
//!     BackoffConfig, CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff, RetryOptions,
//! };
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("ward_stream")
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(60)),
//!     ExponentialBackoff::new(BackoffConfig::default()),
//! );
//!
//! let result = breaker
//!     .execute(
//!         |_attempt| async { Ok::<_, &str>("connected") },
//!         RetryOptions::new("stream:ward-7"),
//!     )
//!     .await;
//! # }
//! ```
//!
//! ## Exponential Backoff
//!
//! ```rust
//! use wardstream_resilience::{BackoffConfig, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(
//!     BackoffConfig::new()
//!         .with_initial_delay(Duration::from_millis(100))
//!         .with_max_retries(3)
//!         .with_jitter(false),
//! );
//!
//! assert_eq!(backoff.next_delay("sync"), Some(Duration::from_millis(100)));
//! ```
//!
//! ## Retry Classification
//!
//! ```rust
//! use wardstream_resilience::{DefaultRetryClassifier, HttpRetryClassifier};
//!
//! assert!(HttpRetryClassifier::is_status_retryable(503));
//! assert!(HttpRetryClassifier::is_status_retryable(429));
//! assert!(!HttpRetryClassifier::is_status_retryable(400));
//!
//! assert!(DefaultRetryClassifier::is_message_retryable("read ECONNRESET"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adaptive;
pub mod backoff;
pub mod circuit_breaker;
pub mod retry_policy;

// Re-export main types
pub use adaptive::{AdaptiveBackoff, AdaptiveConfig};

pub use backoff::{
    execute_with, BackoffConfig, BackoffSchedule, DecorrelatedJitter, ExponentialBackoff,
    OnRetryFn, RetryAttempt, RetryError, RetryMetrics, RetryOptions, RetryRecord, RetryStrategy,
    ShouldRetryFn,
};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitMetrics, CircuitOpenError,
    CircuitState, StateTransition,
};

pub use retry_policy::{
    typed_should_retry, DefaultRetryClassifier, HttpRetryClassifier, RetryClassifier,
    TypedRetryClassifier,
};
