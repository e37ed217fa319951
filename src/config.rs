use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    algorithm::Algorithm,
    error::{RateLimitError, Result},
    utils::ttl_from_secs,
};

/// Validated rate limit parameters: at most `max_requests` per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    max_requests: u64,
    window_seconds: f64,
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window_seconds: f64) -> Result<Self> {
        if max_requests == 0 {
            return Err(RateLimitError::Config(
                "max_requests must be positive".to_string(),
            ));
        }
        if !window_seconds.is_finite() || window_seconds <= 0.0 {
            return Err(RateLimitError::Config(
                "window_seconds must be positive".to_string(),
            ));
        }
        // state lives for up to two windows
        if Duration::try_from_secs_f64(window_seconds * 2.0).is_err() {
            return Err(RateLimitError::Config(format!(
                "window_seconds {} is too large",
                window_seconds
            )));
        }

        Ok(Self {
            max_requests,
            window_seconds,
        })
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    pub fn window(&self) -> Duration {
        ttl_from_secs(self.window_seconds)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

/// Declarative description of a limiter, loadable from YAML and the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,

    /// Prefixed to every identifier so several tiers can share one backend
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
            namespace: None,
            storage: StorageSettings::default(),
        }
    }
}

impl LimiterSettings {
    /// Validate the numeric part of the settings.
    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        RateLimitConfig::new(self.max_requests, self.window_seconds)
    }
}

/// Which backend holds per-identifier state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageSettings {
    Memory {
        #[serde(default)]
        max_list_len: Option<usize>,
    },
    Redis(RedisSettings),
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings::Memory { max_list_len: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default)]
    pub key_prefix: Option<String>,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Serve from a local in-memory store while Redis is unreachable
    #[serde(default)]
    pub fallback_to_memory: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            fallback_to_memory: false,
        }
    }
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_seconds() -> f64 {
    60.0
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

/// Load settings from YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<LimiterSettings> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load settings from YAML file
pub fn load_settings_from_file(path: &str) -> Result<LimiterSettings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}

/// Load settings from an optional file, overridden by `RATELIMIT_*` variables.
///
/// Nested keys use a double underscore, e.g. `RATELIMIT_STORAGE__URL`.
pub fn load_settings(path: Option<&str>) -> Result<LimiterSettings> {
    let mut builder = ::config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(::config::File::with_name(path));
    }

    builder
        .add_source(
            ::config::Environment::with_prefix("RATELIMIT")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|settings| settings.try_deserialize::<LimiterSettings>())
        .map_err(|e| RateLimitError::Config(format!("Failed to load settings: {}", e)))
}
