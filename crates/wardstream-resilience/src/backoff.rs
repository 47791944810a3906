//! Keyed exponential backoff with jitter
//!
//! [`ExponentialBackoff`] tracks one [`RetryRecord`] per retry key and
//! drives [`execute`](ExponentialBackoff::execute), which re-invokes a
//! fallible async operation with growing delays until it succeeds, fails
//! with a non-retryable error, or runs out of retries.
//!
//! [`BackoffSchedule`] and [`DecorrelatedJitter`] are plain delay iterators
//! for callers that manage their own loop.

use crate::retry_policy::DefaultRetryClassifier;
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
    /// Sample the final delay uniformly from `[delay/2, delay]`
    pub jitter: bool,
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_retries: 3,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set maximum retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Create an aggressive config for fast retries
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 1.5,
            jitter: true,
            max_retries: 5,
        }
    }

    /// Create a conservative config for slow retries
    pub fn conservative() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_retries: 3,
        }
    }

    /// Reconnect tuning for metered mobile links
    pub fn mobile() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            multiplier: 2.5,
            jitter: true,
            max_retries: 8,
        }
    }

    /// Delay for `attempt` (0-indexed) before jitter, using `multiplier`.
    pub fn base_delay(&self, attempt: u32, multiplier: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            self.max_delay
        }
    }
}

/// Applies `[delay/2, delay]` jitter
fn jittered(delay: Duration) -> Duration {
    let full = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    if full == 0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    Duration::from_nanos(rng.gen_range(full / 2..=full))
}

/// Per-key retry bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRecord {
    /// Retry key
    pub key: String,
    /// Retries scheduled so far
    pub attempt_count: u32,
    /// Delay chosen for the most recent retry
    pub last_delay: Duration,
}

/// Snapshot of retry counters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryMetrics {
    /// Every invocation of a wrapped operation
    pub total_attempts: u64,
    /// Operations that succeeded after at least one retry
    pub successful_retries: u64,
    /// Operations that failed with a non-retryable error
    pub failed_retries: u64,
    /// Operations abandoned after exhausting retries
    pub abandoned_retries: u64,
    /// Share of finished operations that succeeded
    pub success_rate: f64,
    /// Keys with a live retry record
    pub active_retries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_attempts: AtomicU64,
    successes: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    abandoned_retries: AtomicU64,
}

/// Details handed to the `on_retry` callback
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// The failure that triggered the retry
    pub error: &'a E,
    /// Index of the failed invocation
    pub attempt: u32,
    /// Delay before the next invocation
    pub delay: Duration,
    /// Index of the next invocation
    pub next_attempt: u32,
}

/// Decides whether a failure is retried: `(error, attempt_index)`
pub type ShouldRetryFn<E> = Box<dyn Fn(&E, u32) -> bool + Send + Sync>;

/// Observes scheduled retries
pub type OnRetryFn<E> = Box<dyn Fn(&RetryAttempt<'_, E>) + Send + Sync>;

/// Options for a single `execute` call
pub struct RetryOptions<E> {
    key: String,
    should_retry: Option<ShouldRetryFn<E>>,
    on_retry: Option<OnRetryFn<E>>,
}

impl<E> RetryOptions<E> {
    /// Options for `key`, using the default retry classification
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            should_retry: None,
            on_retry: None,
        }
    }

    /// Overrides the retry decision
    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&E, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Box::new(f));
        self
    }

    /// Registers a callback invoked before each retry sleep
    pub fn with_on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryAttempt<'_, E>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(f));
        self
    }

    /// Retry key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("key", &self.key)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Failure returned by `execute`
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Retries exhausted
    #[error("Max retries exceeded ({attempts}) for '{key}': {last_error}")]
    MaxRetriesExceeded {
        /// Retry key
        key: String,
        /// Retries performed before giving up
        attempts: u32,
        /// The final failure
        last_error: E,
    },

    /// The failure was classified as non-retryable
    #[error("{0}")]
    NonRetryable(E),
}

impl<E> RetryError<E> {
    /// The underlying failure
    pub fn last_error(&self) -> &E {
        match self {
            Self::MaxRetriesExceeded { last_error, .. } => last_error,
            Self::NonRetryable(e) => e,
        }
    }

    /// Consumes the error and returns the underlying failure
    pub fn into_inner(self) -> E {
        match self {
            Self::MaxRetriesExceeded { last_error, .. } => last_error,
            Self::NonRetryable(e) => e,
        }
    }

    /// True when retries ran out
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }
}

impl From<RetryError<wardstream_error::WardstreamError>> for wardstream_error::WardstreamError {
    fn from(err: RetryError<wardstream_error::WardstreamError>) -> Self {
        match err {
            RetryError::MaxRetriesExceeded {
                key,
                attempts,
                last_error,
            } => Self::MaxRetriesExceeded {
                key,
                attempts,
                last_error: last_error.to_string(),
            },
            RetryError::NonRetryable(e) => e,
        }
    }
}

/// A retry strategy: the keyed backoff plus its multiplier policy.
///
/// [`ExponentialBackoff`] uses its configured multiplier; adaptive
/// strategies override [`current_multiplier`](Self::current_multiplier)
/// and [`track_outcome`](Self::track_outcome).
pub trait RetryStrategy: Send + Sync {
    /// The keyed backoff state
    fn backoff(&self) -> &ExponentialBackoff;

    /// Multiplier used for the next delay computation
    fn current_multiplier(&self) -> f64 {
        self.backoff().config().multiplier
    }

    /// Observes the outcome of every invocation
    fn track_outcome(&self, _success: bool) {}

    /// Next delay for `key`, or `None` once retries are exhausted
    fn next_delay(&self, key: &str) -> Option<Duration> {
        self.backoff()
            .next_delay_with_multiplier(key, self.current_multiplier())
    }
}

/// Keyed exponential backoff
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    records: DashMap<String, RetryRecord>,
    counters: Counters,
}

impl ExponentialBackoff {
    /// Create a new backoff instance
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Create with default config
    pub fn default_config() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Configuration in use
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Retries recorded for `key`
    pub fn attempts(&self, key: &str) -> u32 {
        self.records.get(key).map(|r| r.attempt_count).unwrap_or(0)
    }

    /// The live record for `key`, if any
    pub fn record(&self, key: &str) -> Option<RetryRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Next delay for `key`, or `None` once retries are exhausted
    pub fn next_delay(&self, key: &str) -> Option<Duration> {
        self.next_delay_with_multiplier(key, self.config.multiplier)
    }

    /// Next delay for `key` computed with an explicit multiplier
    pub fn next_delay_with_multiplier(&self, key: &str, multiplier: f64) -> Option<Duration> {
        let attempt = self.attempts(key);
        if attempt >= self.config.max_retries {
            return None;
        }
        Some(self.delay_for_attempt(attempt, multiplier))
    }

    /// Delay for a given attempt, jitter applied when enabled
    pub fn delay_for_attempt(&self, attempt: u32, multiplier: f64) -> Duration {
        let delay = self.config.base_delay(attempt, multiplier);
        if self.config.jitter {
            jittered(delay)
        } else {
            delay
        }
    }

    /// Records a scheduled retry for `key`, returning the new count
    pub fn record_retry(&self, key: &str, delay: Duration) -> u32 {
        let mut entry = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RetryRecord {
                key: key.to_string(),
                attempt_count: 0,
                last_delay: Duration::ZERO,
            });
        entry.attempt_count += 1;
        entry.last_delay = delay;
        entry.attempt_count
    }

    /// Forget the record for `key`
    pub fn reset(&self, key: &str) {
        self.records.remove(key);
    }

    /// Forget every record
    pub fn reset_all(&self) {
        self.records.clear();
    }

    /// Current counters
    pub fn metrics(&self) -> RetryMetrics {
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let failed = self.counters.failed_retries.load(Ordering::Relaxed);
        let abandoned = self.counters.abandoned_retries.load(Ordering::Relaxed);
        let finished = successes + failed + abandoned;

        RetryMetrics {
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            successful_retries: self.counters.successful_retries.load(Ordering::Relaxed),
            failed_retries: failed,
            abandoned_retries: abandoned,
            success_rate: if finished == 0 {
                1.0
            } else {
                successes as f64 / finished as f64
            },
            active_retries: self.records.len(),
        }
    }

    /// Runs `f` with retries, using this backoff's own multiplier
    pub async fn execute<F, Fut, T, E>(
        &self,
        f: F,
        options: RetryOptions<E>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        execute_with(self, f, options).await
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::default_config()
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn backoff(&self) -> &ExponentialBackoff {
        self
    }
}

/// Runs `f(attempt_index)` under `strategy` until it succeeds, fails with a
/// non-retryable error, or exhausts `max_retries`.
pub async fn execute_with<S, F, Fut, T, E>(
    strategy: &S,
    mut f: F,
    options: RetryOptions<E>,
) -> Result<T, RetryError<E>>
where
    S: RetryStrategy + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let backoff = strategy.backoff();
    let counters = &backoff.counters;
    let key = options.key.as_str();
    let mut attempt: u32 = 0;

    loop {
        counters.total_attempts.fetch_add(1, Ordering::Relaxed);

        let error = match f(attempt).await {
            Ok(value) => {
                strategy.track_outcome(true);
                counters.successes.fetch_add(1, Ordering::Relaxed);
                if attempt > 0 {
                    counters.successful_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key, attempts = attempt, "Operation succeeded after retry");
                }
                backoff.reset(key);
                return Ok(value);
            }
            Err(e) => e,
        };

        strategy.track_outcome(false);

        let retryable = match &options.should_retry {
            Some(should_retry) => should_retry(&error, attempt),
            None => DefaultRetryClassifier::is_message_retryable(&error.to_string()),
        };

        if !retryable {
            counters.failed_retries.fetch_add(1, Ordering::Relaxed);
            backoff.reset(key);
            tracing::debug!(key, attempt, error = %error, "Non-retryable failure");
            return Err(RetryError::NonRetryable(error));
        }

        let retries = backoff.attempts(key);
        if retries >= backoff.config.max_retries {
            counters.abandoned_retries.fetch_add(1, Ordering::Relaxed);
            backoff.reset(key);
            tracing::warn!(key, retries, error = %error, "Max retries exceeded, abandoning");
            return Err(RetryError::MaxRetriesExceeded {
                key: key.to_string(),
                attempts: retries,
                last_error: error,
            });
        }

        let delay = backoff.delay_for_attempt(retries, strategy.current_multiplier());
        if let Some(on_retry) = &options.on_retry {
            on_retry(&RetryAttempt {
                error: &error,
                attempt,
                delay,
                next_attempt: attempt + 1,
            });
        }
        backoff.record_retry(key, delay);

        tracing::debug!(key, attempt, delay = ?delay, error = %error, "Operation failed, will retry");
        drop(error);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Unkeyed exponential delay iterator
pub struct BackoffSchedule {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffSchedule {
    /// Create a new schedule
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Get the current attempt number (0-indexed)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if more retries are allowed
    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    /// Get remaining retries
    pub fn remaining(&self) -> u32 {
        self.config.max_retries.saturating_sub(self.attempt)
    }

    /// Reset the schedule
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.can_retry() {
            return None;
        }
        let delay = self.config.base_delay(self.attempt, self.config.multiplier);
        self.attempt += 1;
        Some(if self.config.jitter {
            jittered(delay)
        } else {
            delay
        })
    }
}

/// Decorrelated jitter backoff
///
/// `sleep = min(cap, random_between(base, previous * 3))`, which spreads
/// retry times across clients better than plain jitter.
pub struct DecorrelatedJitter {
    config: BackoffConfig,
    attempt: u32,
    previous_delay: Duration,
}

impl DecorrelatedJitter {
    /// Create new decorrelated jitter backoff
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            previous_delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Check if more retries are allowed
    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    /// Reset state
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous_delay = self.config.initial_delay;
    }
}

impl Iterator for DecorrelatedJitter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.can_retry() {
            return None;
        }

        let mut rng = rand::thread_rng();
        let base = self.config.initial_delay.as_secs_f64();
        let cap = self.config.max_delay.as_secs_f64();
        let prev = self.previous_delay.as_secs_f64();

        let next = rng.gen_range(base..(prev * 3.0).max(base + 0.001));
        self.previous_delay = Duration::from_secs_f64(next.min(cap));
        self.attempt += 1;

        Some(self.previous_delay)
    }
}
