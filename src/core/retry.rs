//! Bounded-backoff retry for transient ingest and delivery errors.
//!
//! Only errors the error type itself marks recoverable are retried; a
//! non-recoverable error returns immediately so callers can apply their
//! source's drop policy (the UDP listener never retries, the tailer drops a
//! line after the attempts here are spent, notification channels give up
//! and log).

use crate::core::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff schedule parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Spread delays by up to 20% to avoid lockstep retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): base × 2^(attempt-1),
    /// clamped to the ceiling, plus optional jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let mut delay = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        if self.jitter {
            let spread_ms = delay.as_millis() as u64 / 5;
            if spread_ms > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=spread_ms));
            }
        }
        delay
    }
}

/// Run `operation` until it succeeds, the attempts are spent, or it fails
/// with a non-recoverable error.
pub async fn retry_with_config<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=config.max_attempts.max(1) {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_recoverable() {
            tracing::debug!(attempt, kind = error.category(), "not retryable: {}", error);
            return Err(error);
        }
        if attempt == config.max_attempts.max(1) {
            tracing::warn!(attempt, kind = error.category(), "retries exhausted: {}", error);
            return Err(error);
        }
        let delay = config.delay_for(attempt);
        tracing::warn!(
            attempt,
            kind = error.category(),
            delay_ms = delay.as_millis() as u64,
            "transient failure, backing off: {}",
            error
        );
        sleep(delay).await;
    }
    unreachable!("loop returns on the final attempt")
}

/// Retry with the default schedule.
pub async fn retry<F, Fut, T>(operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_config(RetryConfig::default(), operation).await
}
