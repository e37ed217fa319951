use std::{borrow::Cow, future::Future, sync::Arc};
use tracing::{info, trace, warn};

use crate::{
    algorithm::{
        Algorithm, FixedWindowLimiter, RateLimitResult, SlidingWindowCounterLimiter,
        SlidingWindowLogLimiter, TokenBucketLimiter,
    },
    config::{LimiterSettings, RateLimitConfig, StorageSettings},
    error::{RateLimitError, Result},
    fallback::FallbackStorage,
    memory::InMemoryStorage,
    metrics::Metrics,
    redis::{RedisConfig, RedisStorage},
    storage::StorageBackend,
    utils::{system_clock, Clock},
};

/// One of the four algorithms, bound to its storage and clock
enum AlgorithmLimiter {
    FixedWindow(FixedWindowLimiter),
    TokenBucket(TokenBucketLimiter),
    SlidingWindowLog(SlidingWindowLogLimiter),
    SlidingWindowCounter(SlidingWindowCounterLimiter),
}

impl AlgorithmLimiter {
    fn new(
        algorithm: Algorithm,
        config: RateLimitConfig,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        match algorithm {
            Algorithm::FixedWindow => {
                Self::FixedWindow(FixedWindowLimiter::with_clock(config, storage, clock))
            }
            Algorithm::TokenBucket => {
                Self::TokenBucket(TokenBucketLimiter::with_clock(config, storage, clock))
            }
            Algorithm::SlidingWindowLog => {
                Self::SlidingWindowLog(SlidingWindowLogLimiter::with_clock(config, storage, clock))
            }
            Algorithm::SlidingWindowCounter => Self::SlidingWindowCounter(
                SlidingWindowCounterLimiter::with_clock(config, storage, clock),
            ),
        }
    }

    async fn allow(&self, identifier: &str) -> Result<RateLimitResult> {
        match self {
            Self::FixedWindow(limiter) => limiter.allow(identifier).await,
            Self::TokenBucket(limiter) => limiter.allow(identifier).await,
            Self::SlidingWindowLog(limiter) => limiter.allow(identifier).await,
            Self::SlidingWindowCounter(limiter) => limiter.allow(identifier).await,
        }
    }
}

/// Entry point: picks an algorithm and answers admission checks
pub struct RateLimiter {
    algorithm: Algorithm,
    config: RateLimitConfig,
    limiter: AlgorithmLimiter,
    storage: Arc<dyn StorageBackend>,
    namespace: Option<String>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    /// Limiter backed by a fresh in-memory store
    pub fn new(algorithm: Algorithm, config: RateLimitConfig) -> Self {
        Self::builder(algorithm, config).build()
    }

    /// Limiter backed by the given store
    pub fn with_storage(
        algorithm: Algorithm,
        config: RateLimitConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self::builder(algorithm, config).storage(storage).build()
    }

    pub fn builder(algorithm: Algorithm, config: RateLimitConfig) -> RateLimiterBuilder {
        RateLimiterBuilder {
            algorithm,
            config,
            storage: None,
            clock: None,
            namespace: None,
            metrics: None,
        }
    }

    /// Build the limiter and its storage stack from loaded settings.
    ///
    /// With `fallback_to_memory`, a Redis that cannot be reached at startup
    /// yields a purely in-memory limiter, and one that drops later is
    /// bridged by [`FallbackStorage`].
    pub async fn from_settings(settings: &LimiterSettings) -> Result<Self> {
        let config = settings.rate_limit_config()?;

        let storage: Arc<dyn StorageBackend> = match &settings.storage {
            StorageSettings::Memory { max_list_len } => {
                let storage = InMemoryStorage::new();
                match max_list_len {
                    Some(max_list_len) => Arc::new(storage.with_max_list_len(*max_list_len)),
                    None => Arc::new(storage),
                }
            }
            StorageSettings::Redis(redis) => {
                match RedisStorage::connect(RedisConfig::from(redis)).await {
                    Ok(storage) if redis.fallback_to_memory => Arc::new(FallbackStorage::new(
                        Arc::new(storage),
                        Arc::new(InMemoryStorage::new()),
                    )),
                    Ok(storage) => Arc::new(storage),
                    Err(e) if redis.fallback_to_memory && e.is_unavailable() => {
                        warn!("Redis unavailable at startup, limiting in memory: {}", e);
                        Arc::new(InMemoryStorage::new())
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        info!(
            algorithm = %settings.algorithm,
            max_requests = config.max_requests(),
            window_seconds = config.window_seconds(),
            "Rate limiter configured"
        );

        let mut builder = Self::builder(settings.algorithm, config).storage(storage);
        if let Some(namespace) = &settings.namespace {
            builder = builder.namespace(namespace.clone());
        }
        Ok(builder.build())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Check whether a request from `identifier` is admitted.
    ///
    /// A denial is an `Ok` result with `allowed == false`; errors are only
    /// storage failures.
    pub async fn allow(&self, identifier: &str) -> Result<RateLimitResult> {
        let identifier = self.scoped(identifier);
        let _timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.start_decision_timer(self.algorithm));

        match self.limiter.allow(&identifier).await {
            Ok(result) => {
                trace!(algorithm = %self.algorithm, identifier = %identifier, %result, "Rate limit decision");
                if let Some(metrics) = &self.metrics {
                    metrics.record_decision(self.algorithm, &result);
                }
                Ok(result)
            }
            Err(e) => {
                warn!(algorithm = %self.algorithm, identifier = %identifier, "Rate limit check failed: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_storage_error(self.algorithm);
                }
                Err(e)
            }
        }
    }

    /// Like [`allow`](Self::allow), but a denial becomes `LimitExceeded`.
    pub async fn check(&self, identifier: &str) -> Result<RateLimitResult> {
        let result = self.allow(identifier).await?;
        if result.allowed {
            Ok(result)
        } else {
            Err(RateLimitError::LimitExceeded(Box::new(result)))
        }
    }

    /// Run `f` only if `identifier` is admitted.
    pub async fn run<F, Fut, T>(&self, identifier: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.check(identifier).await?;
        Ok(f().await)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.storage.health_check().await
    }

    fn scoped<'a>(&self, identifier: &'a str) -> Cow<'a, str> {
        match &self.namespace {
            Some(namespace) => Cow::Owned(format!("{}:{}", namespace, identifier)),
            None => Cow::Borrowed(identifier),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Algorithm::default(), RateLimitConfig::default())
    }
}

/// Builder for a [`RateLimiter`] with non-default collaborators
pub struct RateLimiterBuilder {
    algorithm: Algorithm,
    config: RateLimitConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
    namespace: Option<String>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiterBuilder {
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Time source for the algorithms; also drives expiry of the default
    /// in-memory store.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Prefix identifiers so several limiters can share one store.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> RateLimiter {
        let clock = self.clock.unwrap_or_else(system_clock);
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::with_clock(clock.clone())));

        RateLimiter {
            algorithm: self.algorithm,
            config: self.config,
            limiter: AlgorithmLimiter::new(self.algorithm, self.config, storage.clone(), clock),
            storage,
            namespace: self.namespace,
            metrics: self.metrics,
        }
    }
}
