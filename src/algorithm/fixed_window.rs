use std::sync::Arc;
use tracing::{debug, trace};

use super::{Algorithm, RateLimitResult};
use crate::{
    config::RateLimitConfig,
    error::Result,
    storage::StorageBackend,
    utils::{calculate_reset, generate_key, system_clock, window_id, Clock},
};

/// Counts requests in fixed, aligned time windows.
///
/// Cheap (one counter per identifier and window) but a client can get up to
/// twice the limit through by bursting at the end of one window and the start
/// of the next.
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
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
        let window = window_id(now, window_seconds)?;
        let key = generate_key(Algorithm::FixedWindow.key_prefix(), identifier, Some(window));

        let count = self.storage.increment(&key, self.config.window()).await?;
        let count = count.max(0) as u64;
        let max_requests = self.config.max_requests();
        let reset_at = calculate_reset(window, window_seconds);

        trace!(key = %key, count, limit = max_requests, "Fixed window check");

        if count <= max_requests {
            Ok(RateLimitResult::allowed(max_requests - count, reset_at))
        } else {
            debug!(key = %key, count, "Fixed window limit exceeded");
            Ok(RateLimitResult::denied(reset_at, reset_at - now))
        }
    }
}
