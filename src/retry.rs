//! Generic retry/backoff engine.
//!
//! Knows nothing about payments or messaging: any fallible async operation
//! whose error type can report [`Retryable::is_retryable`] and absorb a
//! [`Cancelled`] signal can be wrapped with [`with_retry`].

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that know whether another attempt may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Returned when the caller's token fires before or between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Backoff configuration shared read-only by every operation using the same policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// A strategy that never sleeps. Useful for callers that only want the
    /// attempt bound.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Number of attempts actually made; zero is treated as a single attempt.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the failed attempt with 0-based index `attempt`.
    ///
    /// Every attempt after the first waits `initial_interval * multiplier`:
    /// the interval does not compound across attempts. Always capped at
    /// `max_interval`.
    pub fn next_interval(&self, attempt: u32) -> Duration {
        let interval = if attempt == 0 {
            self.initial_interval
        } else {
            let secs = self.initial_interval.as_secs_f64() * self.multiplier.max(0.0);
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
        };
        interval.min(self.max_interval)
    }

    /// Whether a failure on the 0-based `attempt` earns another try.
    pub fn should_retry<E: Retryable>(&self, attempt: u32, err: &E) -> bool {
        attempt + 1 < self.attempts() && err.is_retryable()
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent. The last error is returned unchanged.
///
/// The token is checked before every attempt and raced against the backoff
/// sleep; cancellation wins over issuing another attempt.
pub async fn with_retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    strategy: &RetryStrategy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + From<Cancelled> + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !strategy.should_retry(attempt, &err) {
            if err.is_retryable() {
                tracing::warn!(attempt = attempt + 1, error = %err, "Retry budget exhausted");
            } else {
                tracing::debug!(attempt = attempt + 1, error = %err, "Not retrying operation");
            }
            return Err(err);
        }

        let interval = strategy.next_interval(attempt);
        tracing::info!(
            attempt = attempt + 1,
            delay_ms = interval.as_millis() as u64,
            error = %err,
            "Retrying operation"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            _ = tokio::time::sleep(interval) => {}
        }
        attempt += 1;
    }
}
