use std::sync::Arc;
use tracing::{debug, trace};

use super::{Algorithm, RateLimitResult};
use crate::{
    config::RateLimitConfig,
    error::Result,
    storage::StorageBackend,
    utils::{generate_key, system_clock, ttl_from_secs, window_id, Clock},
};

/// Weighted blend of the previous and current fixed-window counters.
///
/// This is an approximation: it assumes requests in the previous window were
/// spread uniformly, so the estimate can be off in either direction when they
/// were not. It smooths the fixed-window boundary burst while storing only two
/// counters per identifier. Concurrent checks for one identifier may each pass
/// the estimate before any of them increments, so under contention a few
/// requests beyond the limit can be admitted.
pub struct SlidingWindowCounterLimiter {
    config: RateLimitConfig,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowCounterLimiter {
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

    pub async fn allow(&self, identifier: &str) -> Result<RateLimitResult> {
        let now = self.clock.now();
        let window_seconds = self.config.window_seconds();
        let current_window = window_id(now, window_seconds)?;
        let prefix = Algorithm::SlidingWindowCounter.key_prefix();
        let current_key = generate_key(prefix, identifier, Some(current_window));
        let previous_key = generate_key(prefix, identifier, Some(current_window.saturating_sub(1)));

        let current_count = self.count(&current_key).await?;
        let previous_count = self.count(&previous_key).await?;

        let window_start = current_window as f64 * window_seconds;
        let elapsed_fraction = ((now - window_start) / window_seconds).clamp(0.0, 1.0);
        let weighted_count = previous_count as f64 * (1.0 - elapsed_fraction) + current_count as f64;
        let max_requests = self.config.max_requests() as f64;
        let reset_at = window_start + window_seconds;

        trace!(
            key = %current_key,
            current_count,
            previous_count,
            weighted_count,
            "Sliding counter check"
        );

        if weighted_count < max_requests {
            self.storage
                .increment(&current_key, ttl_from_secs(window_seconds * 2.0))
                .await?;
            let remaining = (max_requests - weighted_count - 1.0).floor().max(0.0);
            Ok(RateLimitResult::allowed(remaining as u64, reset_at))
        } else {
            debug!(key = %current_key, weighted_count, "Sliding counter limit exceeded");
            Ok(RateLimitResult::denied(
                reset_at,
                (1.0 - elapsed_fraction) * window_seconds,
            ))
        }
    }

    async fn count(&self, key: &str) -> Result<i64> {
        Ok(self
            .storage
            .get(key)
            .await?
            .and_then(|value| value.as_i64())
            .unwrap_or(0))
    }
}
