//! Rate Limiting Engine
//!
//! Four admission algorithms (fixed window, token bucket, sliding window log
//! and sliding window counter) behind one `RateLimiter`, over a pluggable
//! storage backend: in memory for a single process, Redis when several
//! processes must share limits.

pub mod algorithm;
pub mod config;
pub mod error;
pub mod fallback;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod storage;
pub mod utils;

// Re-export main types
pub use algorithm::{Algorithm, RateLimitResult};
pub use crate::config::{LimiterSettings, RateLimitConfig};
pub use error::{RateLimitError, Result};
pub use fallback::FallbackStorage;
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use memory::InMemoryStorage;
pub use crate::redis::{RedisConfig, RedisStorage};
pub use storage::{StorageBackend, StoredValue};
