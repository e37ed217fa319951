use thiserror::Error;

use crate::algorithm::RateLimitResult;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limiting engine
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown algorithm: {0}. Choose from: fixed_window, token_bucket, sliding_window_log, sliding_window_counter")]
    UnknownAlgorithm(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Only produced by the `check`/`run` wrappers; `allow` reports denials
    /// through `RateLimitResult::allowed`.
    #[error("Rate limit exceeded. Retry after {:.2} seconds", .0.retry_after.unwrap_or(0.0))]
    LimitExceeded(Box<RateLimitResult>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RateLimitError {
    /// The denied result carried by `LimitExceeded`, if any.
    pub fn limit_result(&self) -> Option<&RateLimitResult> {
        match self {
            Self::LimitExceeded(result) => Some(result),
            _ => None,
        }
    }

    /// Whether the backend could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_timeout()
            || err.is_connection_dropped()
        {
            Self::StorageUnavailable(err.to_string())
        } else {
            Self::Storage(err.to_string())
        }
    }
}
