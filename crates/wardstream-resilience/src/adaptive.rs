//! Adaptive backoff
//!
//! Wraps [`ExponentialBackoff`] with a rolling window of recent outcomes and
//! tunes the multiplier from the observed success rate: a struggling
//! dependency gets slower retries, a healthy one faster ones.

use crate::backoff::{
    execute_with, BackoffConfig, ExponentialBackoff, RetryError, RetryOptions, RetryStrategy,
};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

/// Adaptive tuning parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Outcomes kept in the rolling window
    pub window_size: usize,
    /// Success rate below which retries slow down
    pub low_success_threshold: f64,
    /// Success rate above which retries speed up
    pub high_success_threshold: f64,
    /// Factor applied to the base multiplier on a low success rate
    pub boost_factor: f64,
    /// Factor applied to the base multiplier on a high success rate
    pub reduce_factor: f64,
    /// Upper bound for a boosted multiplier
    pub max_multiplier: f64,
    /// Lower bound for a reduced multiplier
    pub min_multiplier: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            low_success_threshold: 0.3,
            high_success_threshold: 0.7,
            boost_factor: 1.5,
            reduce_factor: 0.8,
            max_multiplier: 3.0,
            min_multiplier: 1.5,
        }
    }
}

impl AdaptiveConfig {
    /// Set the window size (at least 1)
    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size.max(1);
        self
    }

    /// Set the success-rate thresholds
    pub fn with_thresholds(mut self, low: f64, high: f64) -> Self {
        self.low_success_threshold = low;
        self.high_success_threshold = high;
        self
    }
}

/// Exponential backoff whose multiplier follows recent success rates
pub struct AdaptiveBackoff {
    inner: ExponentialBackoff,
    config: AdaptiveConfig,
    outcomes: Mutex<VecDeque<bool>>,
}

impl AdaptiveBackoff {
    /// Creates an adaptive strategy over `backoff`
    pub fn new(backoff: BackoffConfig, config: AdaptiveConfig) -> Self {
        Self {
            inner: ExponentialBackoff::new(backoff),
            outcomes: Mutex::new(VecDeque::with_capacity(config.window_size)),
            config,
        }
    }

    /// Adaptive tuning with default window and thresholds
    pub fn with_backoff(backoff: BackoffConfig) -> Self {
        Self::new(backoff, AdaptiveConfig::default())
    }

    fn window(&self) -> MutexGuard<'_, VecDeque<bool>> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one outcome, dropping the oldest beyond the window.
    pub fn record_outcome(&self, success: bool) {
        let mut window = self.window();
        window.push_back(success);
        while window.len() > self.config.window_size {
            window.pop_front();
        }
    }

    /// Success rate over the window, `None` before any outcome
    pub fn recent_success_rate(&self) -> Option<f64> {
        let window = self.window();
        if window.is_empty() {
            return None;
        }
        let successes = window.iter().filter(|ok| **ok).count();
        Some(successes as f64 / window.len() as f64)
    }

    /// Multiplier derived from the current window
    ///
    /// A boost never drops below the base multiplier and a reduction never
    /// rises above it, whatever the configured bounds.
    pub fn adaptive_multiplier(&self) -> f64 {
        let base = self.inner.config().multiplier;
        match self.recent_success_rate() {
            Some(rate) if rate < self.config.low_success_threshold => (base
                * self.config.boost_factor)
                .min(self.config.max_multiplier)
                .max(base),
            Some(rate) if rate > self.config.high_success_threshold => (base
                * self.config.reduce_factor)
                .max(self.config.min_multiplier)
                .min(base),
            _ => base,
        }
    }

    /// Clears the outcome window
    pub fn clear_outcomes(&self) {
        self.window().clear();
    }

    /// Runs `f` with retries, tuning delays from recent outcomes
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

impl RetryStrategy for AdaptiveBackoff {
    fn backoff(&self) -> &ExponentialBackoff {
        &self.inner
    }

    fn current_multiplier(&self) -> f64 {
        self.adaptive_multiplier()
    }

    fn track_outcome(&self, success: bool) {
        self.record_outcome(success);
    }
}

impl fmt::Debug for AdaptiveBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBackoff")
            .field("config", &self.config)
            .field("multiplier", &self.adaptive_multiplier())
            .finish()
    }
}
