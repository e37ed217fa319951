use chrono::Utc;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::error::{RateLimitError, Result};

/// Source of unix time, in fractional seconds.
///
/// Storage expiry and every algorithm read time through the same clock so a
/// test can drive both from one `ManualClock`.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> f64;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.advance_secs(by.as_secs_f64());
    }

    pub fn advance_secs(&self, secs: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + secs).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Shared handle to the default wall clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Index of the fixed window containing `now`.
///
/// Fails when the index does not fit an `i64`, which a very small window can
/// cause at real unix timestamps.
pub fn window_id(now: f64, window_seconds: f64) -> Result<i64> {
    let index = (now / window_seconds).floor();
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range
    if index.is_finite() && index >= i64::MIN as f64 && index < i64::MAX as f64 {
        Ok(index as i64)
    } else {
        Err(RateLimitError::Config(format!(
            "window_seconds {} is too small to index time {}",
            window_seconds, now
        )))
    }
}

/// Unix time at which the window after `window_id` starts.
pub fn calculate_reset(window_id: i64, window_seconds: f64) -> f64 {
    (window_id as f64 + 1.0) * window_seconds
}

/// Generate a storage key: `{prefix}:{identifier}[:{window_id}]`
pub fn generate_key(prefix: &str, identifier: &str, window_id: Option<i64>) -> String {
    match window_id {
        Some(window) => format!("{}:{}:{}", prefix, identifier, window),
        None => format!("{}:{}", prefix, identifier),
    }
}

/// TTL for a window length given in (possibly fractional) seconds.
///
/// Saturates at `Duration::MAX`; `RateLimitConfig::new` rejects windows that
/// would get there.
pub fn ttl_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// TTL in whole milliseconds, never below one so a key is not created already expired.
pub fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_secs_f64() * 1000.0;
    (millis.ceil() as u64).clamp(1, i64::MAX as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_id() {
        assert_eq!(window_id(9.9, 10.0).unwrap(), 0);
        assert_eq!(window_id(10.0, 10.0).unwrap(), 1);
        assert_eq!(window_id(10.1, 10.0).unwrap(), 1);
        assert_eq!(window_id(0.25, 0.1).unwrap(), 2);
    }

    #[test]
    fn test_window_id_out_of_range() {
        let err = window_id(1_700_000_000.0, 1e-12).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
        assert!(window_id(1_700_000_000.0, 1e-9).is_ok());
    }

    #[test]
    fn test_calculate_reset_at_last_window() {
        let reset = calculate_reset(i64::MAX, 1e-9);
        assert!(reset.is_finite());
    }

    #[test]
    fn test_ttl_from_secs_saturates() {
        assert_eq!(ttl_from_secs(1e30), Duration::MAX);
        assert_eq!(ttl_from_secs(-1.0), Duration::ZERO);
        assert_eq!(ttl_millis(Duration::MAX), i64::MAX as u64);
    }

    #[test]
    fn test_calculate_reset() {
        assert_eq!(calculate_reset(0, 10.0), 10.0);
        assert_eq!(calculate_reset(99, 60.0), 6000.0);
    }

    #[test]
    fn test_key_generation() {
        assert_eq!(generate_key("fw", "user1", Some(42)), "fw:user1:42");
        assert_eq!(generate_key("tb", "user1", None), "tb:user1");
        assert_eq!(generate_key("swl", "", None), "swl:");
    }

    #[test]
    fn test_ttl_millis_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::from_micros(1500)), 2);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), 101.5);

        clock.set(5.0);
        assert_eq!(clock.now(), 5.0);
    }

    #[test]
    fn test_system_clock_is_unix_seconds() {
        let now = SystemClock.now();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800.0);
    }
}
