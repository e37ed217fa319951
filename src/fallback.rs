//! Degrade to a secondary backend while the primary is unreachable.

use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::warn;

use crate::{
    error::Result,
    storage::{StorageBackend, StoredValue, WindowLogAdmission},
};

/// Routes each call to `primary`, retrying it on `secondary` when the primary
/// reports `StorageUnavailable`.
///
/// State is not copied between the two, so limits are enforced per backend
/// while degraded. Any other error is returned as is.
pub struct FallbackStorage {
    primary: Arc<dyn StorageBackend>,
    secondary: Arc<dyn StorageBackend>,
    degraded_calls: AtomicU64,
}

impl FallbackStorage {
    pub fn new(primary: Arc<dyn StorageBackend>, secondary: Arc<dyn StorageBackend>) -> Self {
        Self {
            primary,
            secondary,
            degraded_calls: AtomicU64::new(0),
        }
    }

    /// Calls served by the secondary backend so far.
    pub fn degraded_calls(&self) -> u64 {
        self.degraded_calls.load(Ordering::Relaxed)
    }

    fn falls_back<T>(&self, operation: &str, result: &Result<T>) -> bool {
        match result {
            Err(err) if err.is_unavailable() => {
                let calls = self.degraded_calls.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(operation, degraded_calls = calls, "Primary storage unavailable, using fallback: {}", err);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl StorageBackend for FallbackStorage {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let result = self.primary.increment(key, ttl).await;
        if self.falls_back("increment", &result) {
            return self.secondary.increment(key, ttl).await;
        }
        result
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let result = self.primary.get(key).await;
        if self.falls_back("get", &result) {
            return self.secondary.get(key).await;
        }
        result
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        let result = self.primary.set(key, value, ttl).await;
        if self.falls_back("set", &result) {
            return self.secondary.set(key, value, ttl).await;
        }
        result
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        let result = self.primary.compare_and_set(key, expected, new, ttl).await;
        if self.falls_back("compare_and_set", &result) {
            return self.secondary.compare_and_set(key, expected, new, ttl).await;
        }
        result
    }

    async fn append_to_list(&self, key: &str, value: f64, ttl: Duration) -> Result<usize> {
        let result = self.primary.append_to_list(key, value, ttl).await;
        if self.falls_back("append_to_list", &result) {
            return self.secondary.append_to_list(key, value, ttl).await;
        }
        result
    }

    async fn read_list(&self, key: &str) -> Result<Vec<f64>> {
        let result = self.primary.read_list(key).await;
        if self.falls_back("read_list", &result) {
            return self.secondary.read_list(key).await;
        }
        result
    }

    async fn trim_list(&self, key: &str, cutoff: f64) -> Result<usize> {
        let result = self.primary.trim_list(key, cutoff).await;
        if self.falls_back("trim_list", &result) {
            return self.secondary.trim_list(key, cutoff).await;
        }
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = self.primary.delete(key).await;
        if self.falls_back("delete", &result) {
            return self.secondary.delete(key).await;
        }
        result
    }

    async fn record_in_window(
        &self,
        key: &str,
        now: f64,
        cutoff: f64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowLogAdmission> {
        let result = self
            .primary
            .record_in_window(key, now, cutoff, limit, ttl)
            .await;
        if self.falls_back("record_in_window", &result) {
            return self
                .secondary
                .record_in_window(key, now, cutoff, limit, ttl)
                .await;
        }
        result
    }

    /// Healthy as long as one of the two backends is.
    async fn health_check(&self) -> Result<()> {
        let result = self.primary.health_check().await;
        if self.falls_back("health_check", &result) {
            return self.secondary.health_check().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::RateLimitError, memory::InMemoryStorage};

    /// Backend that fails every call with a fixed error kind.
    struct BrokenStorage {
        unavailable: bool,
    }

    impl BrokenStorage {
        fn error(&self) -> RateLimitError {
            if self.unavailable {
                RateLimitError::StorageUnavailable("connection refused".to_string())
            } else {
                RateLimitError::Storage("WRONGTYPE".to_string())
            }
        }
    }

    #[async_trait]
    impl StorageBackend for BrokenStorage {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<i64> {
            Err(self.error())
        }

        async fn get(&self, _key: &str) -> Result<Option<StoredValue>> {
            Err(self.error())
        }

        async fn set(&self, _key: &str, _value: StoredValue, _ttl: Duration) -> Result<()> {
            Err(self.error())
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&StoredValue>,
            _new: StoredValue,
            _ttl: Duration,
        ) -> Result<bool> {
            Err(self.error())
        }

        async fn append_to_list(&self, _key: &str, _value: f64, _ttl: Duration) -> Result<usize> {
            Err(self.error())
        }

        async fn read_list(&self, _key: &str) -> Result<Vec<f64>> {
            Err(self.error())
        }

        async fn trim_list(&self, _key: &str, _cutoff: f64) -> Result<usize> {
            Err(self.error())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(self.error())
        }

        async fn health_check(&self) -> Result<()> {
            Err(self.error())
        }
    }

    #[tokio::test]
    async fn test_unavailable_primary_uses_secondary() {
        let secondary = Arc::new(InMemoryStorage::new());
        let storage = FallbackStorage::new(
            Arc::new(BrokenStorage { unavailable: true }),
            secondary.clone(),
        );
        let ttl = Duration::from_secs(10);

        assert_eq!(storage.increment("key1", ttl).await.unwrap(), 1);
        assert_eq!(storage.increment("key1", ttl).await.unwrap(), 2);
        assert_eq!(
            secondary.get("key1").await.unwrap(),
            Some(StoredValue::Integer(2))
        );
        assert!(storage.health_check().await.is_ok());
        assert_eq!(storage.degraded_calls(), 3);
    }

    #[tokio::test]
    async fn test_window_log_falls_back_atomically() {
        let storage = FallbackStorage::new(
            Arc::new(BrokenStorage { unavailable: true }),
            Arc::new(InMemoryStorage::new()),
        );
        let ttl = Duration::from_secs(10);

        let admission = storage.record_in_window("log", 1.0, 0.0, 1, ttl).await.unwrap();
        assert!(admission.admitted);
        let admission = storage.record_in_window("log", 2.0, 0.0, 1, ttl).await.unwrap();
        assert!(!admission.admitted);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_masked() {
        let storage = FallbackStorage::new(
            Arc::new(BrokenStorage { unavailable: false }),
            Arc::new(InMemoryStorage::new()),
        );

        let err = storage
            .increment("key1", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Storage(_)));
        assert_eq!(storage.degraded_calls(), 0);
    }

    #[tokio::test]
    async fn test_healthy_primary_is_used() {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        let storage = FallbackStorage::new(primary.clone(), secondary.clone());

        storage.increment("key1", Duration::from_secs(10)).await.unwrap();

        assert_eq!(primary.len().unwrap(), 1);
        assert!(secondary.is_empty().unwrap());
        assert_eq!(storage.degraded_calls(), 0);
    }
}
