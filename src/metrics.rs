use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

use crate::algorithm::{Algorithm, RateLimitResult};

/// Prometheus collectors for limiter decisions
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    decisions: CounterVec,
    storage_errors: CounterVec,
    decision_duration: HistogramVec,
}

impl Metrics {
    /// Create collectors registered in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create collectors registered in an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Number of rate limit decisions by algorithm and outcome",
            ),
            &["algorithm", "outcome"],
        )?;

        let storage_errors = CounterVec::new(
            Opts::new(
                "ratelimit_storage_errors_total",
                "Number of checks that failed because of the storage backend",
            ),
            &["algorithm"],
        )?;

        let decision_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_decision_duration_seconds",
                "Duration of rate limit checks in seconds",
            ),
            &["algorithm"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(storage_errors.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            storage_errors,
            decision_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one check
    pub fn record_decision(&self, algorithm: Algorithm, result: &RateLimitResult) {
        let outcome = if result.allowed { "allowed" } else { "denied" };
        self.decisions
            .with_label_values(&[algorithm.as_str(), outcome])
            .inc();
    }

    pub fn record_storage_error(&self, algorithm: Algorithm) {
        self.storage_errors
            .with_label_values(&[algorithm.as_str()])
            .inc();
    }

    /// Timer observing into the duration histogram when dropped
    pub fn start_decision_timer(&self, algorithm: Algorithm) -> prometheus::HistogramTimer {
        self.decision_duration
            .with_label_values(&[algorithm.as_str()])
            .start_timer()
    }
}
