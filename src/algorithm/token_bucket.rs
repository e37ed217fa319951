use std::sync::Arc;
use tracing::{debug, trace};

use super::{Algorithm, RateLimitResult};
use crate::{
    config::RateLimitConfig,
    error::{RateLimitError, Result},
    storage::{StorageBackend, StoredValue},
    utils::{generate_key, system_clock, ttl_from_secs, Clock},
};

/// Give up after this many lost compare-and-set races in one call.
const MAX_UPDATE_ATTEMPTS: usize = 64;

/// Slack on the one-token check, in tokens.
///
/// `now - last_refill` is only as precise as the spacing of f64 values near
/// `now` (about 2.4e-7 s at current unix times), so a refill that should add
/// exactly one token can come out a hair short. The slack covers a few of
/// those steps at the current refill rate.
fn refill_tolerance(now: f64, refill_rate: f64) -> f64 {
    now.abs() * f64::EPSILON * 4.0 * refill_rate + 1e-9
}

/// Bucket of `max_requests` tokens refilled continuously over the window.
///
/// Allows bursts up to the bucket size. Refill is computed from the stored
/// `(tokens, last_refill)` on every request, so there is no background task
/// and any process sharing the storage sees the same bucket.
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig, storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_clock(config, storage, system_clock())
    }

    pub fn with_clock(
        config: RateLimitConfig,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            storage,
            clock,
        }
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.config.max_requests() as f64 / self.config.window_seconds()
    }

    pub async fn allow(&self, identifier: &str) -> Result<RateLimitResult> {
        let key = generate_key(Algorithm::TokenBucket.key_prefix(), identifier, None);
        let capacity = self.config.max_requests() as f64;
        let window_seconds = self.config.window_seconds();
        let refill_rate = self.refill_rate();
        let ttl = ttl_from_secs(window_seconds * 2.0);

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let now = self.clock.now();
            let stored = self.storage.get(&key).await?;

            let (tokens, last_refill) = match stored {
                Some(StoredValue::Bucket {
                    tokens,
                    last_refill,
                }) => (tokens, last_refill),
                _ => {
                    debug!(key = %key, "Creating full token bucket");
                    (capacity, now)
                }
            };

            let elapsed = (now - last_refill).max(0.0);
            let mut tokens = (tokens + elapsed * refill_rate).min(capacity);
            let allowed = tokens + refill_tolerance(now, refill_rate) >= 1.0;
            if allowed {
                tokens = (tokens - 1.0).max(0.0);
            }

            let next = StoredValue::Bucket {
                tokens,
                last_refill: now.max(last_refill),
            };
            if !self
                .storage
                .compare_and_set(&key, stored.as_ref(), next, ttl)
                .await?
            {
                trace!(key = %key, attempt, "Token bucket changed concurrently, retrying");
                continue;
            }

            trace!(key = %key, tokens, allowed, "Token bucket check");

            let reset_at = now + window_seconds;
            return Ok(if allowed {
                RateLimitResult::allowed(tokens.floor() as u64, reset_at)
            } else {
                debug!(key = %key, "Token bucket empty");
                RateLimitResult::denied(reset_at, (1.0 - tokens) / refill_rate)
            });
        }

        Err(RateLimitError::Storage(format!(
            "Token bucket `{}` kept changing during {} update attempts",
            key, MAX_UPDATE_ATTEMPTS
        )))
    }
}
