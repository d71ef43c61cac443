//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `service_mapper_config_reconciliations_total` - BindingConfig reconciliations
//! - `service_mapper_config_reconciliation_errors_total` - Failed BindingConfig reconciliations
//! - `service_mapper_reconciliation_duration_seconds` - Duration of BindingConfig reconciliations
//! - `service_mapper_instance_events_total{event}` - Instance watch events dispatched
//! - `service_mapper_instance_event_failures_total` - Instance event units that exhausted retries
//! - `service_mapper_artifacts_materialized_total` - Derived artifact Secrets created or replaced
//! - `service_mapper_rule_evaluation_errors_total{reason}` - Binding rules that failed to evaluate
//! - `service_mapper_active_watches` - Currently open instance watches
//! - `service_mapper_requeues_total{reason}` - BindingConfig requeues

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static CONFIG_RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_mapper_config_reconciliations_total",
        "Total number of BindingConfig reconciliations",
    )
    .expect("Failed to create CONFIG_RECONCILIATIONS_TOTAL metric - this should never happen")
});

static CONFIG_RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_mapper_config_reconciliation_errors_total",
        "Total number of failed BindingConfig reconciliations",
    )
    .expect("Failed to create CONFIG_RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "service_mapper_reconciliation_duration_seconds",
            "Duration of BindingConfig reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static INSTANCE_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_mapper_instance_events_total",
            "Total number of instance watch events dispatched, by event type",
        ),
        &["event"],
    )
    .expect("Failed to create INSTANCE_EVENTS_TOTAL metric - this should never happen")
});

static INSTANCE_EVENT_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_mapper_instance_event_failures_total",
        "Total number of instance event units dropped after exhausting retries",
    )
    .expect("Failed to create INSTANCE_EVENT_FAILURES_TOTAL metric - this should never happen")
});

static ARTIFACTS_MATERIALIZED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_mapper_artifacts_materialized_total",
        "Total number of derived artifact Secrets created or replaced",
    )
    .expect("Failed to create ARTIFACTS_MATERIALIZED_TOTAL metric - this should never happen")
});

static RULE_EVALUATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_mapper_rule_evaluation_errors_total",
            "Total number of binding rules that failed to evaluate, by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create RULE_EVALUATION_ERRORS_TOTAL metric - this should never happen")
});

static ACTIVE_WATCHES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "service_mapper_active_watches",
        "Current number of open instance watches",
    )
    .expect("Failed to create ACTIVE_WATCHES metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_mapper_requeues_total",
            "Total number of BindingConfig requeues, by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(CONFIG_RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONFIG_RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(INSTANCE_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INSTANCE_EVENT_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACTS_MATERIALIZED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RULE_EVALUATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_WATCHES.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_config_reconciliations() {
    CONFIG_RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_config_reconciliation_errors() {
    CONFIG_RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_instance_events(event: &str) {
    INSTANCE_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn increment_instance_event_failures() {
    INSTANCE_EVENT_FAILURES_TOTAL.inc();
}

pub fn increment_artifacts_materialized() {
    ARTIFACTS_MATERIALIZED_TOTAL.inc();
}

pub fn increment_rule_evaluation_errors(reason: &str) {
    RULE_EVALUATION_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_active_watches(count: i64) {
    ACTIVE_WATCHES.set(count);
}

pub fn increment_requeues(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_config_reconciliations() {
        let before = CONFIG_RECONCILIATIONS_TOTAL.get();
        increment_config_reconciliations();
        let after = CONFIG_RECONCILIATIONS_TOTAL.get();
        assert!(after > before);
    }

    #[test]
    fn test_rule_evaluation_errors_by_reason() {
        let counter = RULE_EVALUATION_ERRORS_TOTAL.with_label_values(&["malformed_rule"]);
        let before = counter.get();
        increment_rule_evaluation_errors("malformed_rule");
        assert!(counter.get() > before);
    }
}
