//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the notary engine.
//!
//! # Metrics
//!
//! - `notary_numbers_issued_total` - Transaction numbers issued
//! - `notary_deliveries_total` - Successful nymbox deliveries
//! - `notary_delivery_failures_total` - Aborted deliveries
//! - `notary_delivery_duration_seconds` - Delivery latency histogram
//! - `notary_cron_ticks_total` - Cron ticks completed
//! - `notary_cron_items_active` - Active cron items
//! - `notary_cron_tick_duration_seconds` - Tick duration histogram

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Transaction numbers issued
    pub numbers_issued: IntCounter,

    /// Successful nymbox deliveries
    pub deliveries: IntCounter,

    /// Aborted deliveries
    pub delivery_failures: IntCounter,

    /// Delivery latency histogram
    pub delivery_duration: Histogram,

    /// Cron ticks completed
    pub cron_ticks: IntCounter,

    /// Active cron items
    pub cron_items_active: IntGauge,

    /// Tick duration histogram
    pub cron_tick_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let numbers_issued = IntCounter::with_opts(Opts::new(
            "notary_numbers_issued_total",
            "Transaction numbers issued",
        ))?;
        registry.register(Box::new(numbers_issued.clone()))?;

        let deliveries = IntCounter::with_opts(Opts::new(
            "notary_deliveries_total",
            "Successful nymbox deliveries",
        ))?;
        registry.register(Box::new(deliveries.clone()))?;

        let delivery_failures = IntCounter::with_opts(Opts::new(
            "notary_delivery_failures_total",
            "Aborted deliveries",
        ))?;
        registry.register(Box::new(delivery_failures.clone()))?;

        let delivery_duration = Histogram::with_opts(
            HistogramOpts::new(
                "notary_delivery_duration_seconds",
                "Delivery latency histogram",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(delivery_duration.clone()))?;

        let cron_ticks = IntCounter::with_opts(Opts::new(
            "notary_cron_ticks_total",
            "Cron ticks completed",
        ))?;
        registry.register(Box::new(cron_ticks.clone()))?;

        let cron_items_active = IntGauge::with_opts(Opts::new(
            "notary_cron_items_active",
            "Active cron items",
        ))?;
        registry.register(Box::new(cron_items_active.clone()))?;

        let cron_tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "notary_cron_tick_duration_seconds",
                "Tick duration histogram",
            )
            .buckets(vec![0.001, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(cron_tick_duration.clone()))?;

        Ok(Self {
            numbers_issued,
            deliveries,
            delivery_failures,
            delivery_duration,
            cron_ticks,
            cron_items_active,
            cron_tick_duration,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metrics registration cannot fail on a fresh registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let metrics = Metrics::new().unwrap();

        metrics.numbers_issued.inc();
        metrics.deliveries.inc();
        metrics.delivery_failures.inc();
        metrics.cron_ticks.inc();
        metrics.cron_items_active.set(3);

        assert_eq!(metrics.numbers_issued.get(), 1);
        assert_eq!(metrics.cron_items_active.get(), 3);
        assert!(!metrics.registry.gather().is_empty());
    }
}
