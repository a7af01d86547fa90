//! Bounded retry with exponential backoff for contended transactions.
//!
//! Only storage contention (`StorageError::Busy`) is retried. Every other
//! error returns immediately. When attempts run out the last contention
//! error is surfaced as [`EngineError::TransientStorage`].

use crate::config::RetryConfig;
use crate::{EngineError, EngineResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Random jitter as a fraction of the delay (0.1 = +/-10%).
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// No sleeping between attempts; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: 0.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms * self.backoff_factor.powi(exp)).min(max_ms);

        let jitter_ms = if self.jitter > 0.0 && base_ms > 0.0 {
            let range = base_ms * self.jitter;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter_ms).max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-contention error, or
/// the policy's attempts are spent.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &'static str,
    mut operation: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        retries = attempt,
                        "operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_contention() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "storage contention persisted through all attempts"
                    );
                    return Err(EngineError::TransientStorage {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after storage contention"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
