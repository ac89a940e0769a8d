//! Prometheus metrics for the settlement core
//!
//! # Metrics
//!
//! - `settlement_intents_submitted_total` - Accepted submissions
//! - `settlement_intents_committed_total` - Intents committed
//! - `settlement_intents_reverted_total` - Intents reverted with refund
//! - `settlement_intents_failed_total` - Intents failed after retries
//! - `settlement_intents_expired_total` - Intents expired before inclusion
//! - `settlement_reorgs_total` - INCLUDED intents returned to SIGNED
//! - `settlement_execution_attempts_total` - EVM execution attempts
//! - `settlement_launches_finalized_total` - Launches that reached the cap
//! - `settlement_execution_duration_seconds` - Histogram of execution latency
//! - `settlement_refunds_pending` - Refunds awaiting the settlement cycle

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector; each instance owns its registry
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Accepted submissions
    pub intents_submitted: IntCounter,

    /// Committed intents
    pub intents_committed: IntCounter,

    /// Reverted intents
    pub intents_reverted: IntCounter,

    /// Failed intents
    pub intents_failed: IntCounter,

    /// Expired intents
    pub intents_expired: IntCounter,

    /// Reorgs applied
    pub reorgs: IntCounter,

    /// EVM execution attempts
    pub execution_attempts: IntCounter,

    /// Launches finalized
    pub launches_finalized: IntCounter,

    /// Execution latency
    pub execution_duration: Histogram,

    /// Unpaid refunds
    pub refunds_pending: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let intents_submitted =
            counter("settlement_intents_submitted_total", "Accepted submissions")?;
        let intents_committed =
            counter("settlement_intents_committed_total", "Intents committed")?;
        let intents_reverted = counter(
            "settlement_intents_reverted_total",
            "Intents reverted with refund",
        )?;
        let intents_failed = counter(
            "settlement_intents_failed_total",
            "Intents failed after retries",
        )?;
        let intents_expired = counter(
            "settlement_intents_expired_total",
            "Intents expired before inclusion",
        )?;
        let reorgs = counter(
            "settlement_reorgs_total",
            "INCLUDED intents returned to SIGNED",
        )?;
        let execution_attempts = counter(
            "settlement_execution_attempts_total",
            "EVM execution attempts",
        )?;
        let launches_finalized = counter(
            "settlement_launches_finalized_total",
            "Launches that reached the supply cap",
        )?;

        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "settlement_execution_duration_seconds",
                "Histogram of execution latency",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(execution_duration.clone()))?;

        let refunds_pending = IntGauge::new(
            "settlement_refunds_pending",
            "Refunds awaiting the settlement cycle",
        )?;
        registry.register(Box::new(refunds_pending.clone()))?;

        Ok(Self {
            intents_submitted,
            intents_committed,
            intents_reverted,
            intents_failed,
            intents_expired,
            reorgs,
            execution_attempts,
            launches_finalized,
            execution_duration,
            refunds_pending,
            registry,
        })
    }

    /// Record execution duration
    pub fn record_execution_duration(&self, duration_seconds: f64) {
        self.execution_duration.observe(duration_seconds);
    }

    /// Update pending refund gauge
    pub fn update_refunds_pending(&self, pending: usize) {
        self.refunds_pending
            .set(i64::try_from(pending).unwrap_or(i64::MAX));
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
