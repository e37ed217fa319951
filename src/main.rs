use anyhow::Result;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratelimit_engine::{
    config::load_settings, Algorithm, RateLimitConfig, RateLimitError, RateLimitResult,
    RateLimiter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratelimit_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match std::env::var("CONFIG_PATH") {
        Ok(config_path) => run_configured(&config_path).await,
        Err(_) => walkthrough().await,
    }
}

/// Drive a limiter built from a settings file (plus `RATELIMIT_*` overrides).
async fn run_configured(config_path: &str) -> Result<()> {
    info!("Loading settings from: {}", config_path);

    let settings = load_settings(Some(config_path))?;
    let limiter = RateLimiter::from_settings(&settings).await?;
    limiter.health_check().await?;

    let identifier = std::env::var("DEMO_IDENTIFIER").unwrap_or_else(|_| "demo-user".to_string());
    let requests = std::env::var("DEMO_REQUESTS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(settings.max_requests + 2);

    println!(
        "{} limiter: {} requests / {}s",
        limiter.algorithm(),
        settings.max_requests,
        settings.window_seconds
    );
    for i in 0..requests {
        let result = limiter.allow(&identifier).await?;
        print_result(i + 1, &result);
    }

    Ok(())
}

async fn walkthrough() -> Result<()> {
    println!("Rate Limiter Examples\n{}\n", "=".repeat(50));

    println!("1. Token Bucket (allows bursts)\n{}", "-".repeat(50));
    let limiter = RateLimiter::new(Algorithm::TokenBucket, RateLimitConfig::new(5, 10.0)?);
    for i in 0..7 {
        let result = limiter.allow("user123").await?;
        print_result(i + 1, &result);
    }
    println!();

    println!("2. Fixed Window (simple counter)\n{}", "-".repeat(50));
    let limiter = RateLimiter::new(Algorithm::FixedWindow, RateLimitConfig::new(3, 5.0)?);
    for i in 0..5 {
        let result = limiter.allow("user456").await?;
        print_result(i + 1, &result);
    }
    println!();

    println!("3. Sliding Window Counter (balanced)\n{}", "-".repeat(50));
    let limiter = RateLimiter::new(
        Algorithm::SlidingWindowCounter,
        RateLimitConfig::new(4, 10.0)?,
    );
    for i in 0..6 {
        let result = limiter.allow("user789").await?;
        print_result(i + 1, &result);
        if i == 2 {
            println!("  [Waiting 5 seconds...]");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
    println!();

    println!("4. Sliding Window Log (exact)\n{}", "-".repeat(50));
    let limiter = RateLimiter::new(Algorithm::SlidingWindowLog, RateLimitConfig::new(3, 60.0)?);
    for i in 0..5 {
        let call = limiter
            .run("user_abc", || async { "Processing request for user_abc" })
            .await;
        match call {
            Ok(output) => println!("Call {}: {}", i + 1, output),
            Err(e @ RateLimitError::LimitExceeded(_)) => println!("Call {}: {}", i + 1, e),
            Err(e) => return Err(e.into()),
        }
    }

    println!("\n{}\nExamples complete!", "=".repeat(50));
    Ok(())
}

fn print_result(request: u64, result: &RateLimitResult) {
    let status = if result.allowed { "ALLOWED" } else { "DENIED" };
    println!("Request {}: {} (remaining: {})", request, status, result.remaining);
    if let Some(retry_after) = result.retry_after {
        println!("  Retry after: {:.2}s", retry_after);
    }
}
