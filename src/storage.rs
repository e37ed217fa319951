//! Storage contract every algorithm reads and writes through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateLimitError, Result};

/// A scalar stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredValue {
    Integer(i64),
    Float(f64),
    /// Token bucket state, kept as one value so it is never read half-written.
    Bucket { tokens: f64, last_refill: f64 },
}

impl StoredValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StoredValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StoredValue::Integer(value) => Some(*value as f64),
            StoredValue::Float(value) => Some(*value),
            StoredValue::Bucket { .. } => None,
        }
    }

    /// Wire form: integers stay raw so a remote `INCR` keeps working on them.
    pub fn encode(&self) -> Result<String> {
        match self {
            StoredValue::Integer(value) => Ok(value.to_string()),
            other => Ok(serde_json::to_string(other)?),
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        if let Ok(value) = raw.parse::<i64>() {
            return Ok(StoredValue::Integer(value));
        }
        serde_json::from_str(raw).map_err(|e| {
            RateLimitError::Storage(format!("Unrecognised stored value `{}`: {}", raw, e))
        })
    }
}

/// Outcome of [`StorageBackend::record_in_window`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLogAdmission {
    /// Whether `now` was appended to the log
    pub admitted: bool,
    /// Entries left in the window before this call appended anything
    pub prior_count: usize,
    /// Smallest timestamp in the window after the call
    pub oldest: Option<f64>,
}

/// Key/counter/list store with TTL semantics.
///
/// Implementations must be safe to call concurrently; a counter increment is
/// never lost. Failure to reach the backend is reported as
/// `RateLimitError::StorageUnavailable`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Increment a counter (starting from 0), reset its expiry and return the new value
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Current value, or `None` when never set or expired
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Overwrite a value and reset its expiry
    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()>;

    /// Write `new` only if the current value equals `expected` (`None` = absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool>;

    /// Append to a timestamp list, reset its expiry and return the new length
    async fn append_to_list(&self, key: &str, value: f64, ttl: Duration) -> Result<usize>;

    /// All entries of a timestamp list, oldest first
    async fn read_list(&self, key: &str) -> Result<Vec<f64>>;

    /// Remove entries `<= cutoff` and return how many remain
    async fn trim_list(&self, key: &str, cutoff: f64) -> Result<usize>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Trim the log to `> cutoff`, then append `now` if fewer than `limit` entries remain.
    ///
    /// The default composes the list primitives and is not atomic; backends
    /// that can do this in one step override it.
    async fn record_in_window(
        &self,
        key: &str,
        now: f64,
        cutoff: f64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowLogAdmission> {
        self.trim_list(key, cutoff).await?;
        let mut entries = self.read_list(key).await?;
        let prior_count = entries.len();

        let admitted = (prior_count as u64) < limit;
        if admitted {
            self.append_to_list(key, now, ttl).await?;
            entries.push(now);
        }

        Ok(WindowLogAdmission {
            admitted,
            prior_count,
            oldest: entries.into_iter().reduce(f64::min),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encodes_raw() {
        assert_eq!(StoredValue::Integer(42).encode().unwrap(), "42");
        assert_eq!(StoredValue::decode("42").unwrap(), StoredValue::Integer(42));
    }

    #[test]
    fn test_bucket_encoding_is_stable() {
        let bucket = StoredValue::Bucket {
            tokens: 0.1 + 0.2,
            last_refill: 1_700_000_000.123456,
        };
        let encoded = bucket.encode().unwrap();
        let decoded = StoredValue::decode(&encoded).unwrap();

        assert_eq!(decoded, bucket);
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn test_decode_garbage() {
        let err = StoredValue::decode("not a value").unwrap_err();
        assert!(matches!(err, RateLimitError::Storage(_)));
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(StoredValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(StoredValue::Float(2.5).as_i64(), None);
        assert_eq!(
            StoredValue::Bucket {
                tokens: 1.0,
                last_refill: 0.0
            }
            .as_f64(),
            None
        );
    }
}
