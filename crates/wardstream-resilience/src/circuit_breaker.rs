//! Circuit breaker pattern implementation
//!
//! Wraps a [`RetryStrategy`] and stops calling a failing dependency for a
//! cooldown after repeated failures. Every state change is recorded in a
//! bounded transition history.

use crate::backoff::{execute_with, ExponentialBackoff, RetryError, RetryMetrics, RetryOptions, RetryStrategy};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use wardstream_error::WardstreamError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Circuit is half-open - testing if service recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of successes in half-open to close circuit
    pub success_threshold: u32,
    /// Time to wait before trying again (half-open)
    pub reset_timeout: Duration,
    /// Transitions kept in history
    pub history_limit: usize,
    /// Name for logging/metrics
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            history_limit: 100,
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set success threshold for half-open state
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set how many transitions are retained
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Wall-clock time of the change
    pub timestamp: DateTime<Utc>,
}

/// Error when circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker is OPEN for '{name}', retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Name of the circuit breaker
    pub name: String,
    /// Time until circuit may admit a probe call
    pub retry_after: Duration,
}

/// Error type for circuit breaker operations
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was not invoked
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    /// The wrapped retry execution failed
    #[error(transparent)]
    Retry(RetryError<E>),
}

impl<E> CircuitBreakerError<E> {
    /// True when the call was rejected by an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// The operation's own failure, if it ran
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::CircuitOpen(_) => None,
            Self::Retry(e) => Some(e.last_error()),
        }
    }
}

impl From<CircuitBreakerError<WardstreamError>> for WardstreamError {
    fn from(err: CircuitBreakerError<WardstreamError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen(open) => WardstreamError::CircuitOpen {
                name: open.name,
                retry_after_ms: u64::try_from(open.retry_after.as_millis()).unwrap_or(u64::MAX),
            },
            CircuitBreakerError::Retry(e) => e.into(),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone)]
pub struct CircuitMetrics {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Successes while half-open
    pub success_count: u32,
    /// Time until an open circuit admits a probe call
    pub next_attempt_in: Option<Duration>,
    /// Transitions since creation
    pub total_transitions: u64,
    /// Latest transitions, oldest first
    pub history: Vec<StateTransition>,
    /// Metrics of the wrapped retry strategy
    pub retry: RetryMetrics,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    history: VecDeque<StateTransition>,
    total_transitions: u64,
}

/// Circuit breaker around a retry strategy
pub struct CircuitBreaker<S = ExponentialBackoff> {
    config: CircuitBreakerConfig,
    strategy: S,
    core: Mutex<BreakerCore>,
}

impl<S: RetryStrategy> CircuitBreaker<S> {
    /// Create a new circuit breaker with config
    pub fn new(config: CircuitBreakerConfig, strategy: S) -> Self {
        Self {
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt: None,
                history: VecDeque::with_capacity(config.history_limit.min(128)),
                total_transitions: 0,
            }),
            config,
            strategy,
        }
    }

    fn core(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The wrapped retry strategy
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.core().state
    }

    /// Check if circuit allows requests, moving an expired open circuit to
    /// half-open.
    pub fn can_execute(&self) -> Result<(), CircuitOpenError> {
        let mut core = self.core();
        if core.state != CircuitState::Open {
            return Ok(());
        }

        let now = Instant::now();
        match core.next_attempt {
            Some(next) if now < next => Err(CircuitOpenError {
                name: self.config.name.clone(),
                retry_after: next - now,
            }),
            _ => {
                self.transition(&mut core, CircuitState::HalfOpen);
                tracing::info!(circuit = %self.config.name, "Circuit half-open, probing");
                Ok(())
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut core = self.core();
        match core.state {
            CircuitState::HalfOpen => {
                core.success_count += 1;
                if core.success_count >= self.config.success_threshold {
                    self.transition(&mut core, CircuitState::Closed);
                    tracing::info!(
                        circuit = %self.config.name,
                        "Circuit closed after successful recovery"
                    );
                }
            }
            CircuitState::Closed => {
                core.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut core = self.core();
        match core.state {
            CircuitState::Closed => {
                core.failure_count += 1;
                if core.failure_count >= self.config.failure_threshold {
                    let failures = core.failure_count;
                    self.transition(&mut core, CircuitState::Open);
                    tracing::warn!(
                        circuit = %self.config.name,
                        failures,
                        "Circuit opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut core, CircuitState::Open);
                tracing::warn!(
                    circuit = %self.config.name,
                    "Circuit reopened after half-open failure"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Execute `f` through the wrapped retry strategy with circuit breaker
    /// protection. An open circuit rejects without invoking `f`.
    pub async fn execute<F, Fut, T, E>(
        &self,
        f: F,
        options: RetryOptions<E>,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.can_execute()
            .map_err(CircuitBreakerError::CircuitOpen)?;

        match execute_with(&self.strategy, f, options).await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Retry(e))
            }
        }
    }

    /// Get metrics
    pub fn circuit_metrics(&self) -> CircuitMetrics {
        let core = self.core();
        CircuitMetrics {
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            next_attempt_in: match core.state {
                CircuitState::Open => core
                    .next_attempt
                    .map(|next| next.saturating_duration_since(Instant::now())),
                _ => None,
            },
            total_transitions: core.total_transitions,
            history: core.history.iter().cloned().collect(),
            retry: self.strategy.backoff().metrics(),
        }
    }

    /// Force closed and clear counters plus the retry-key map
    pub fn reset(&self) {
        {
            let mut core = self.core();
            self.transition(&mut core, CircuitState::Closed);
        }
        self.strategy.backoff().reset_all();
        tracing::info!(circuit = %self.config.name, "Circuit reset");
    }

    /// Force close the circuit (for testing/admin)
    pub fn force_close(&self) {
        let mut core = self.core();
        self.transition(&mut core, CircuitState::Closed);
    }

    /// Force open the circuit (for testing/admin)
    pub fn force_open(&self) {
        let mut core = self.core();
        self.transition(&mut core, CircuitState::Open);
    }

    fn transition(&self, core: &mut BreakerCore, to: CircuitState) {
        let from = core.state;
        core.state = to;
        core.failure_count = 0;
        core.success_count = 0;
        core.next_attempt = match to {
            CircuitState::Open => Some(Instant::now() + self.config.reset_timeout),
            _ => None,
        };

        if from == to {
            return;
        }

        core.total_transitions += 1;
        core.history.push_back(StateTransition {
            from,
            to,
            timestamp: Utc::now(),
        });
        while core.history.len() > self.config.history_limit {
            core.history.pop_front();
        }
        tracing::debug!(circuit = %self.config.name, %from, %to, "Circuit transition");
    }
}

impl CircuitBreaker<ExponentialBackoff> {
    /// Create with default config and name over a default backoff
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name), ExponentialBackoff::default())
    }
}

impl<S> fmt::Debug for CircuitBreaker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::AdaptiveBackoff;
    use crate::backoff::BackoffConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("test")
                .with_failure_threshold(failure_threshold)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_secs(30)),
            ExponentialBackoff::new(
                BackoffConfig::new()
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            ),
        )
    }

    fn no_retry<E>() -> RetryOptions<E> {
        RetryOptions::new("op").with_should_retry(|_, _| false)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.execute(|_| async { Err::<(), _>("down") }, no_retry()).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        cb.execute(|_| async { Ok::<_, &str>(7) }, no_retry()).await
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute().is_ok());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_fn() {
        let cb = breaker(3);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let calls_in = calls.clone();
            let result = cb
                .execute(
                    move |_| {
                        calls_in.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>("down") }
                    },
                    no_retry(),
                )
                .await;
            assert!(result.is_err());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected = fail(&cb).await.unwrap_err();
        assert!(rejected.is_circuit_open());
        assert!(rejected.to_string().contains("OPEN"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.circuit_metrics().failure_count, 2);

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.circuit_metrics().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.can_execute().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);

        let states: Vec<_> = cb
            .circuit_metrics()
            .history
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let open = cb.can_execute().unwrap_err();
        assert!(open.retry_after > Duration::from_secs(29));
        assert!(cb.circuit_metrics().next_attempt_in.is_some());
    }

    #[tokio::test]
    async fn test_retry_failure_counts_once() {
        let cb = breaker(2);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: Result<(), _> = cb
            .execute(
                move |_| {
                    calls_in.fetch_add(1, Ordering::SeqCst);
                    async { Err("network error") }
                },
                RetryOptions::new("op"),
            )
            .await;

        // 1 call + 3 retries, one breaker failure
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Retry(RetryError::MaxRetriesExceeded { .. }))
        ));
        assert_eq!(cb.circuit_metrics().failure_count, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let cb = breaker(1);
        cb.strategy().record_retry("k", Duration::from_millis(5));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let metrics = cb.circuit_metrics();
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.retry.active_retries, 0);
    }

    #[test]
    fn test_force_open_and_close() {
        let cb = CircuitBreaker::with_name("test");
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.can_execute().is_err());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_history_is_bounded() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("bounded").with_history_limit(100),
            ExponentialBackoff::default(),
        );
        for _ in 0..120 {
            cb.force_open();
            cb.force_close();
        }
        let metrics = cb.circuit_metrics();
        assert_eq!(metrics.history.len(), 100);
        assert_eq!(metrics.total_transitions, 240);
    }

    #[tokio::test]
    async fn test_wraps_adaptive_strategy() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("adaptive"),
            AdaptiveBackoff::with_backoff(BackoffConfig::default()),
        );
        let value = cb
            .execute(|_| async { Ok::<_, &str>("ok") }, RetryOptions::new("a"))
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(cb.strategy().recent_success_rate(), Some(1.0));
    }

    #[test]
    fn test_into_wardstream_error() {
        let err: WardstreamError = CircuitBreakerError::<WardstreamError>::CircuitOpen(
            CircuitOpenError {
                name: "stream".to_string(),
                retry_after: Duration::from_millis(1500),
            },
        )
        .into();
        assert_eq!(err.retry_after(), Some(2));
    }
}
