use std::sync::Arc;
use tracing::{debug, trace};

use super::{Algorithm, RateLimitResult};
use crate::{
    config::RateLimitConfig,
    error::Result,
    storage::StorageBackend,
    utils::{generate_key, system_clock, Clock},
};

/// Keeps the timestamp of every admitted request inside the window.
///
/// The only exact algorithm. Memory per identifier is bounded by
/// `max_requests`, since denied requests are never logged.
pub struct SlidingWindowLogLimiter {
    config: RateLimitConfig,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLogLimiter {
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
        let key = generate_key(Algorithm::SlidingWindowLog.key_prefix(), identifier, None);
        let now = self.clock.now();
        let window_seconds = self.config.window_seconds();
        let max_requests = self.config.max_requests();

        let admission = self
            .storage
            .record_in_window(
                &key,
                now,
                now - window_seconds,
                max_requests,
                self.config.window(),
            )
            .await?;

        let oldest = admission.oldest.unwrap_or(now);
        let reset_at = oldest + window_seconds;

        trace!(key = %key, count = admission.prior_count, admitted = admission.admitted, "Sliding log check");

        if admission.admitted {
            let remaining = max_requests - admission.prior_count as u64 - 1;
            Ok(RateLimitResult::allowed(remaining, reset_at))
        } else {
            debug!(key = %key, count = admission.prior_count, "Sliding log limit exceeded");
            Ok(RateLimitResult::denied(reset_at, reset_at - now))
        }
    }
}
