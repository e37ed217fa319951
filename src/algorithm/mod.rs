//! The four admission algorithms and the result they all produce.

mod fixed_window;
mod sliding_window_counter;
mod sliding_window_log;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window_counter::SlidingWindowCounterLimiter;
pub use sliding_window_log::SlidingWindowLogLimiter;
pub use token_bucket::TokenBucketLimiter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

use crate::error::RateLimitError;

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    TokenBucket,
    SlidingWindowLog,
    #[default]
    SlidingWindowCounter,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::FixedWindow,
        Algorithm::TokenBucket,
        Algorithm::SlidingWindowLog,
        Algorithm::SlidingWindowCounter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::SlidingWindowCounter => "sliding_window_counter",
        }
    }

    /// Storage key prefix; distinct per algorithm so they never share state.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fw",
            Algorithm::TokenBucket => "tb",
            Algorithm::SlidingWindowLog => "swl",
            Algorithm::SlidingWindowCounter => "swc",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| RateLimitError::UnknownAlgorithm(s.to_string()))
    }
}

/// Outcome of a single admission check.
///
/// Maps onto the usual headers: `X-RateLimit-Remaining` is `remaining`,
/// `X-RateLimit-Reset` is `reset_at` truncated, `Retry-After` is
/// `retry_after` truncated (denials only).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    /// Unix timestamp, in seconds
    pub reset_at: f64,
    /// Seconds to wait; present only when `allowed` is false
    pub retry_after: Option<f64>,
}

impl RateLimitResult {
    pub fn allowed(remaining: u64, reset_at: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    pub fn denied(reset_at: f64, retry_after: f64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after.max(0.0)),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn retry_after_duration(&self) -> Option<Duration> {
        self.retry_after.map(Duration::from_secs_f64)
    }

    pub fn reset_at_utc(&self) -> Option<DateTime<Utc>> {
        let micros = (self.reset_at * 1_000_000.0).round() as i64;
        DateTime::from_timestamp_micros(micros)
    }
}

impl fmt::Display for RateLimitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RateLimitResult(allowed={}, remaining={}, reset_at={}, retry_after=",
            self.allowed, self.remaining, self.reset_at
        )?;
        match self.retry_after {
            Some(retry_after) => write!(f, "{:.2})", retry_after),
            None => f.write_str("None)"),
        }
    }
}
