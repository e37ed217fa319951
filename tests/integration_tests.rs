use ratelimit_engine::{
    config::{load_settings_from_yaml, StorageSettings},
    utils::ManualClock,
    Algorithm, FallbackStorage, InMemoryStorage, RateLimitConfig, RateLimitError, RateLimiter,
    StorageBackend,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

fn limiter_at(
    algorithm: Algorithm,
    max_requests: u64,
    window_seconds: f64,
    start: f64,
) -> (Arc<ManualClock>, RateLimiter) {
    let clock = Arc::new(ManualClock::new(start));
    let limiter = RateLimiter::builder(
        algorithm,
        RateLimitConfig::new(max_requests, window_seconds).unwrap(),
    )
    .clock(clock.clone())
    .build();
    (clock, limiter)
}

#[tokio::test]
async fn test_exact_algorithms_admit_exactly_max_requests() {
    for algorithm in [
        Algorithm::FixedWindow,
        Algorithm::TokenBucket,
        Algorithm::SlidingWindowLog,
    ] {
        for max_requests in [1, 3, 10] {
            let (_clock, limiter) = limiter_at(algorithm, max_requests, 30.0, 1_000.0);

            for i in 0..max_requests {
                assert!(
                    limiter.allow("user1").await.unwrap().allowed,
                    "{algorithm}: request {} of {max_requests}",
                    i + 1
                );
            }
            let result = limiter.allow("user1").await.unwrap();
            assert!(!result.allowed, "{algorithm}: request {}", max_requests + 1);
            assert_eq!(result.remaining, 0);
            assert!(result.retry_after.unwrap() > 0.0);
        }
    }
}

#[tokio::test]
async fn test_fixed_window_example_scenario() {
    let limiter = RateLimiter::new(Algorithm::FixedWindow, RateLimitConfig::new(3, 60.0).unwrap());

    for expected in [2, 1, 0] {
        let result = limiter.allow("u1").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, expected);
    }

    let fourth = limiter.allow("u1").await.unwrap();
    assert!(!fourth.allowed);
    assert_eq!(fourth.remaining, 0);
    assert!(fourth.retry_after.unwrap() > 0.0);
}

#[tokio::test]
async fn test_sliding_window_log_full_reset() {
    let (clock, limiter) = limiter_at(Algorithm::SlidingWindowLog, 5, 10.0, 1_000.0);

    for _ in 0..5 {
        limiter.allow("user1").await.unwrap();
    }
    clock.advance_secs(10.01);

    let result = limiter.allow("user1").await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 4);
}

#[tokio::test]
async fn test_token_bucket_refills_one_token() {
    let (clock, limiter) = limiter_at(Algorithm::TokenBucket, 4, 10.0, 1_000.0);

    for _ in 0..4 {
        assert!(limiter.allow("user1").await.unwrap().allowed);
    }
    clock.advance_secs(10.0 / 4.0);

    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(!limiter.allow("user1").await.unwrap().allowed);
}

#[tokio::test]
async fn test_fixed_window_boundary_burst() {
    let (clock, limiter) = limiter_at(Algorithm::FixedWindow, 3, 10.0, 9.9);

    for _ in 0..3 {
        assert!(limiter.allow("user1").await.unwrap().allowed);
    }
    clock.set(10.1);
    for _ in 0..3 {
        assert!(limiter.allow("user1").await.unwrap().allowed);
    }
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(matches!(
        RateLimitConfig::new(0, 60.0),
        Err(RateLimitError::Config(_))
    ));
    assert!(matches!(
        RateLimitConfig::new(10, 0.0),
        Err(RateLimitError::Config(_))
    ));
}

#[tokio::test]
async fn test_header_values() {
    let (_clock, limiter) = limiter_at(Algorithm::FixedWindow, 2, 60.0, 1_000.5);

    let allowed = limiter.allow("client").await.unwrap();
    assert_eq!(limiter.config().max_requests(), 2);
    assert_eq!(allowed.remaining, 1);
    assert_eq!(allowed.reset_at as i64, 1_020);
    assert!(allowed.retry_after.is_none());

    limiter.allow("client").await.unwrap();
    let denied = limiter.allow("client").await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after.map(|secs| secs as i64), Some(19));
    assert_eq!(
        denied.reset_at_utc().unwrap().timestamp(),
        denied.reset_at as i64
    );
}

#[tokio::test]
async fn test_multi_tier_limiters_share_storage() {
    let clock = Arc::new(ManualClock::new(1_000.0));
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::with_clock(clock.clone()));

    let build = |namespace: &str, max_requests: u64| {
        RateLimiter::builder(
            Algorithm::SlidingWindowCounter,
            RateLimitConfig::new(max_requests, 60.0).unwrap(),
        )
        .storage(storage.clone())
        .clock(clock.clone())
        .namespace(namespace)
        .build()
    };
    let free = build("free", 2);
    let premium = build("premium", 5);

    let mut free_allowed = 0;
    let mut premium_allowed = 0;
    for _ in 0..6 {
        if free.allow("user1").await.unwrap().allowed {
            free_allowed += 1;
        }
        if premium.allow("user1").await.unwrap().allowed {
            premium_allowed += 1;
        }
    }

    assert_eq!(free_allowed, 2);
    assert_eq!(premium_allowed, 5);
}

#[tokio::test]
async fn test_limiter_from_yaml_settings() {
    let settings = load_settings_from_yaml(
        r#"
algorithm: sliding_window_log
max_requests: 2
window_seconds: 30
storage:
  type: memory
  max_list_len: 100
"#,
    )
    .unwrap();
    assert!(matches!(settings.storage, StorageSettings::Memory { .. }));

    let limiter = RateLimiter::from_settings(&settings).await.unwrap();
    assert_eq!(limiter.algorithm(), Algorithm::SlidingWindowLog);
    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(!limiter.allow("user1").await.unwrap().allowed);
}

#[tokio::test]
async fn test_fallback_storage_behind_limiter() {
    let storage = Arc::new(FallbackStorage::new(
        Arc::new(InMemoryStorage::new()),
        Arc::new(InMemoryStorage::new()),
    ));
    let limiter = RateLimiter::with_storage(
        Algorithm::TokenBucket,
        RateLimitConfig::new(2, 60.0).unwrap(),
        storage.clone(),
    );

    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(!limiter.allow("user1").await.unwrap().allowed);
    assert_eq!(storage.degraded_calls(), 0);
}

#[tokio::test]
async fn test_window_expires_in_real_time() {
    let limiter = RateLimiter::new(Algorithm::FixedWindow, RateLimitConfig::new(2, 0.2).unwrap());

    // start just after a boundary so the burst lands in one window
    let wait = 0.2 - (now_secs() % 0.2) + 0.01;
    sleep(Duration::from_secs_f64(wait)).await;

    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(limiter.allow("user1").await.unwrap().allowed);
    assert!(!limiter.allow("user1").await.unwrap().allowed);

    sleep(Duration::from_millis(250)).await;
    assert!(limiter.allow("user1").await.unwrap().allowed);
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
