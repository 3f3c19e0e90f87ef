//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `pod_timestamp_reconciliations_total` - Total number of reconcile invocations
//! - `pod_timestamp_reconciliation_errors_total` - Total number of failed reconciles
//! - `pod_timestamp_reconciliation_duration_seconds` - Duration of reconcile invocations
//! - `pod_timestamp_annotations_written_total` - Total number of timestamp annotations written
//! - `pod_timestamp_queue_depth` - Keys currently pending in the work queue
//! - `pod_timestamp_queue_retries_total` - Total number of rate-limited requeues
//! - `pod_timestamp_leader` - 1 while this replica holds the leader lease

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pod_timestamp_reconciliations_total",
        "Total number of reconcile invocations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pod_timestamp_reconciliation_errors_total",
        "Total number of failed reconciles",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "pod_timestamp_reconciliation_duration_seconds",
            "Duration of reconcile invocations in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static ANNOTATIONS_WRITTEN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pod_timestamp_annotations_written_total",
        "Total number of timestamp annotations written to Pods",
    )
    .expect("Failed to create ANNOTATIONS_WRITTEN_TOTAL metric - this should never happen")
});

static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pod_timestamp_queue_depth",
        "Keys currently pending in the work queue",
    )
    .expect("Failed to create QUEUE_DEPTH metric - this should never happen")
});

static QUEUE_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pod_timestamp_queue_retries_total",
        "Total number of rate-limited requeues",
    )
    .expect("Failed to create QUEUE_RETRIES_TOTAL metric - this should never happen")
});

static LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pod_timestamp_leader",
        "1 while this replica holds the leader lease",
    )
    .expect("Failed to create LEADER metric - this should never happen")
});

/// Register all metrics with the controller registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(ANNOTATIONS_WRITTEN_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(QUEUE_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LEADER.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(seconds: f64) {
    RECONCILIATION_DURATION.observe(seconds);
}

pub fn increment_annotations_written() {
    ANNOTATIONS_WRITTEN_TOTAL.inc();
}

#[allow(
    clippy::cast_possible_wrap,
    reason = "queue depth never approaches i64::MAX"
)]
pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

pub fn increment_queue_retries() {
    QUEUE_RETRIES_TOTAL.inc();
}

pub fn set_leader(is_leader: bool) {
    LEADER.set(i64::from(is_leader));
}
