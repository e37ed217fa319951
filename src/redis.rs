use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult, Script};
use std::{
    future::Future,
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    config::RedisSettings,
    error::{RateLimitError, Result},
    storage::{StorageBackend, StoredValue, WindowLogAdmission},
    utils::ttl_millis,
};

/// Writes `ARGV[2]` only if the current value equals `ARGV[1]` (empty = absent).
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
    if current then
        return 0
    end
elseif current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// Trims a sorted-set log to scores above `ARGV[2]`, then admits `ARGV[1]`
/// (as member `ARGV[4]`) while fewer than `ARGV[3]` entries remain.
const RECORD_IN_WINDOW: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local count = redis.call('ZCARD', KEYS[1])
local admitted = 0
if count < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    admitted = 1
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_score = ''
if oldest[2] then
    oldest_score = oldest[2]
end
return {admitted, count, oldest_score}
"#;

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    /// Prepended to every key this backend touches
    pub key_prefix: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            key_prefix: None,
        }
    }
}

impl From<&RedisSettings> for RedisConfig {
    fn from(settings: &RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
            key_prefix: settings.key_prefix.clone(),
        }
    }
}

/// Storage backend shared by every process pointing at the same Redis.
///
/// Counters are plain integer keys, scalars are `SET ... PX` strings and
/// timestamp lists are sorted sets scored by timestamp.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    config: RedisConfig,
    member_prefix: String,
    sequence: Arc<AtomicU64>,
    compare_and_set: Script,
    record_in_window: Script,
}

impl RedisStorage {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis storage for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Invalid Redis URL: {}", e);
            RateLimitError::Config(format!("Invalid Redis URL `{}`: {}", config.url, e))
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout, client.get_connection_manager())
                .await
            {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    warn!("Failed to create connection manager: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(
                        "Timeout while creating connection manager ({}ms)",
                        config.connection_timeout.as_millis()
                    );
                    return Err(RateLimitError::StorageUnavailable(
                        "Timeout while creating Redis connection manager".to_string(),
                    ));
                }
            };

        let storage = Self {
            connection,
            member_prefix: format!("{}-{}", process::id(), chrono::Utc::now().timestamp_micros()),
            sequence: Arc::new(AtomicU64::new(0)),
            compare_and_set: Script::new(COMPARE_AND_SET),
            record_in_window: Script::new(RECORD_IN_WINDOW),
            config,
        };

        storage.health_check().await?;
        info!("Redis storage initialized successfully");
        Ok(storage)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn key(&self, key: &str) -> String {
        match &self.config.key_prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Sorted-set members must be unique even for equal timestamps.
    fn member(&self, value: f64) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", value, self.member_prefix, sequence)
    }

    async fn run<T, F>(&self, operation: &'static str, command: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, command).await {
            Ok(result) => result.map_err(|e| {
                debug!(operation, "Redis command failed: {}", e);
                RateLimitError::from(e)
            }),
            Err(_) => {
                warn!(
                    operation,
                    "Redis command timed out after {}ms",
                    self.config.command_timeout.as_millis()
                );
                Err(RateLimitError::StorageUnavailable(format!(
                    "Redis {} timed out",
                    operation
                )))
            }
        }
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let (count,): (i64,) = self
            .run(
                "INCR",
                redis::pipe()
                    .atomic()
                    .incr(&key, 1)
                    .pexpire(&key, ttl_millis(ttl) as i64)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let raw: Option<String> = self.run("GET", conn.get(&key)).await?;
        raw.as_deref().map(StoredValue::decode).transpose()
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        let key = self.key(key);
        let encoded = value.encode()?;
        let mut conn = self.connection.clone();

        self.run(
            "SET",
            redis::cmd("SET")
                .arg(&key)
                .arg(encoded)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        let key = self.key(key);
        let expected = expected.map(StoredValue::encode).transpose()?.unwrap_or_default();
        let new = new.encode()?;
        let mut conn = self.connection.clone();

        let written: i64 = self
            .run(
                "CAS",
                self.compare_and_set
                    .key(&key)
                    .arg(expected)
                    .arg(new)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(written == 1)
    }

    async fn append_to_list(&self, key: &str, value: f64, ttl: Duration) -> Result<usize> {
        let key = self.key(key);
        let member = self.member(value);
        let mut conn = self.connection.clone();

        let (len,): (usize,) = self
            .run(
                "ZADD",
                redis::pipe()
                    .atomic()
                    .zadd(&key, member, value)
                    .ignore()
                    .pexpire(&key, ttl_millis(ttl) as i64)
                    .ignore()
                    .zcard(&key)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(len)
    }

    async fn read_list(&self, key: &str) -> Result<Vec<f64>> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let entries: Vec<(String, f64)> = self
            .run("ZRANGE", conn.zrange_withscores(&key, 0, -1))
            .await?;
        Ok(entries.into_iter().map(|(_, score)| score).collect())
    }

    async fn trim_list(&self, key: &str, cutoff: f64) -> Result<usize> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        let (remaining,): (usize,) = self
            .run(
                "ZREMRANGEBYSCORE",
                redis::pipe()
                    .atomic()
                    .zrembyscore(&key, "-inf", cutoff)
                    .ignore()
                    .zcard(&key)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(remaining)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();

        self.run("DEL", conn.del::<_, ()>(&key)).await
    }

    async fn record_in_window(
        &self,
        key: &str,
        now: f64,
        cutoff: f64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowLogAdmission> {
        let key = self.key(key);
        let member = self.member(now);
        let mut conn = self.connection.clone();

        let (admitted, prior_count, oldest): (i64, usize, String) = self
            .run(
                "RECORD_IN_WINDOW",
                self.record_in_window
                    .key(&key)
                    .arg(now)
                    .arg(cutoff)
                    .arg(limit)
                    .arg(member)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;

        let oldest = if oldest.is_empty() {
            None
        } else {
            Some(oldest.parse::<f64>().map_err(|e| {
                RateLimitError::Storage(format!("Invalid score `{}` in `{}`: {}", oldest, key, e))
            })?)
        };

        Ok(WindowLogAdmission {
            admitted: admitted == 1,
            prior_count,
            oldest,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.run("PING", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}
