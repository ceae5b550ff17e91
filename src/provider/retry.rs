//! Retry policy for provider calls.
//!
//! Transient provider errors are retried with bounded exponential backoff.
//! A rate-limit hint from the provider stretches the wait. When attempts
//! run out the last error is escalated to a fatal `RetriesExhausted`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use validator::Validate;

use crate::error::{ProviderError, Result, StackformError};

/// Backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[validate(range(max = 60_000))]
    pub initial_delay_ms: u64,
    /// Upper bound on the computed delay, in milliseconds.
    #[validate(range(max = 600_000))]
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each attempt.
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy that never waits, for tests and dry runs.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Computes the wait after the given failed attempt (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let computed = (self.initial_delay_ms as f64) * self.multiplier.powi(exponent);
        let capped = computed.min(self.max_delay_ms as f64).max(0.0) as u64;
        let hinted = retry_after_secs.map_or(0, |s| s.saturating_mul(1_000));
        Duration::from_millis(capped.max(hinted))
    }

    /// Runs `operation`, retrying transient provider errors.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, or `RetriesExhausted` once the attempt
    /// budget is spent on transient errors.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(StackformError::Provider(e)) if e.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(ProviderError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        }
                        .into());
                    }
                    let delay = self.delay_for(attempt, e.retry_after_secs());
                    warn!(
                        "{what}: {e} (attempt {attempt}/{max_attempts}, retrying in {}ms)",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
