//! Rate Limiter
//!
//! Persistent token bucket per rotating client bucket id. Refill is lazy and
//! continuous: `tokens = min(capacity, tokens + elapsed * rate)`. A bucket
//! seen for the first time starts full. The read, refill and decrement run
//! inside one storage transaction, so two requests from the same bucket can
//! never spend the same token.

use crate::config::RateLimitConfig;
use crate::retry::{with_retry, RetryPolicy};
use crate::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use eta_storage::{EtaStore, StoreTransaction};
use eta_types::RateLimitBucket;
use std::sync::Arc;
use tracing::info;

/// Quota state reported with an admitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
    /// When the bucket will be full again.
    pub reset_at: DateTime<Utc>,
}

enum Spend {
    Admitted(RateDecision),
    /// Nothing staged; `available` is the refilled balance below one token.
    Denied { available: f64 },
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn EtaStore>,
    retry: RetryPolicy,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn EtaStore>, retry: RetryPolicy) -> Self {
        Self {
            config,
            store,
            retry,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Tokens available at `now`, before spending.
    pub fn refill(&self, bucket: Option<&RateLimitBucket>, now: DateTime<Utc>) -> f64 {
        let capacity = f64::from(self.config.capacity);
        match bucket {
            None => capacity,
            Some(bucket) => {
                let elapsed_ms = (now - bucket.last_refill).num_milliseconds().max(0);
                let elapsed = elapsed_ms as f64 / 1000.0;
                (bucket.tokens + elapsed * self.config.refill_per_sec()).min(capacity)
            }
        }
    }

    /// Spend one token for `bucket_id`, or fail with
    /// [`EngineError::RateLimited`].
    pub async fn check(&self, bucket_id: &str, now: DateTime<Utc>) -> EngineResult<RateDecision> {
        if !self.config.enabled {
            return Ok(RateDecision {
                limit: self.config.capacity,
                remaining: self.config.capacity,
                reset_at: now,
            });
        }
        with_retry(&self.retry, "rate_limit", || self.try_spend(bucket_id, now)).await
    }

    async fn try_spend(&self, bucket_id: &str, now: DateTime<Utc>) -> EngineResult<RateDecision> {
        let mut tx = self.store.begin().await?;
        match self.spend_in(tx.as_mut(), bucket_id, now).await {
            Ok(Spend::Admitted(decision)) => {
                tx.commit().await?;
                Ok(decision)
            }
            Ok(Spend::Denied { available }) => {
                tx.rollback().await?;
                Err(self.denied(bucket_id, available, now))
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    async fn spend_in(
        &self,
        tx: &mut dyn StoreTransaction,
        bucket_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Spend> {
        let current = tx.get_bucket(bucket_id).await?;
        let available = self.refill(current.as_ref(), now);
        if available < 1.0 {
            return Ok(Spend::Denied { available });
        }

        let tokens = available - 1.0;
        tx.put_bucket(&RateLimitBucket {
            bucket_id: bucket_id.to_string(),
            tokens,
            last_refill: now,
        })
        .await?;

        Ok(Spend::Admitted(RateDecision {
            limit: self.config.capacity,
            remaining: tokens.floor() as u32,
            reset_at: now + self.seconds_until(f64::from(self.config.capacity) - tokens),
        }))
    }

    fn denied(&self, bucket_id: &str, available: f64, now: DateTime<Utc>) -> EngineError {
        let wait = self.seconds_until(1.0 - available);
        let retry_after_secs = (wait.num_milliseconds().max(0) as u64).div_ceil(1000).max(1);
        info!(
            bucket = %bucket_prefix(bucket_id),
            retry_after_secs,
            "rate limit exceeded"
        );
        EngineError::RateLimited {
            limit: self.config.capacity,
            remaining: 0,
            reset_at: now + self.seconds_until(f64::from(self.config.capacity) - available),
            retry_after_secs,
        }
    }

    /// Time needed to accumulate `tokens` more tokens.
    fn seconds_until(&self, tokens: f64) -> Duration {
        let rate = self.config.refill_per_sec();
        if tokens <= 0.0 || rate <= 0.0 {
            return Duration::zero();
        }
        Duration::milliseconds((tokens / rate * 1000.0).ceil() as i64)
    }
}

/// First eight characters of a bucket id, the most that is ever logged.
pub fn bucket_prefix(bucket_id: &str) -> &str {
    let end = bucket_id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(bucket_id.len());
    &bucket_id[..end]
}
