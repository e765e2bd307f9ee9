//! Metrics module for membership-service.
//! Provides Prometheus metrics for lifecycle operations, billing events and
//! processor calls.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "membership_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Payment processor call duration histogram
pub static GATEWAY_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "membership_gateway_call_duration_seconds",
            "Payment processor call duration"
        ),
        &["operation", "outcome"]
    )
    .expect("Failed to register GATEWAY_CALL_DURATION")
});

/// Lifecycle operations (activate, pause, resume, cancel, reactivate)
pub static LIFECYCLE_OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "membership_lifecycle_operations_total",
            "Total lifecycle operations by operation and outcome"
        ),
        &["operation", "outcome"]
    )
    .expect("Failed to register LIFECYCLE_OPERATIONS_TOTAL")
});

/// Billing events by type and outcome
pub static BILLING_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "membership_billing_events_total",
            "Billing events received by type and outcome"
        ),
        &["event_type", "outcome"]
    )
    .expect("Failed to register BILLING_EVENTS_TOTAL")
});

/// Manual payment recoveries by path and outcome
pub static RECOVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "membership_recoveries_total",
            "Manual payment recoveries by path and outcome"
        ),
        &["path", "outcome"]
    )
    .expect("Failed to register RECOVERIES_TOTAL")
});

/// Receipt notifications by outcome
pub static RECEIPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("membership_receipts_total", "Receipt notifications by outcome"),
        &["outcome"]
    )
    .expect("Failed to register RECEIPTS_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&GATEWAY_CALL_DURATION);
    Lazy::force(&LIFECYCLE_OPERATIONS_TOTAL);
    Lazy::force(&BILLING_EVENTS_TOTAL);
    Lazy::force(&RECOVERIES_TOTAL);
    Lazy::force(&RECEIPTS_TOTAL);
}

pub fn record_lifecycle_operation(operation: &str, outcome: &str) {
    LIFECYCLE_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_billing_event(event_type: &str, outcome: &str) {
    BILLING_EVENTS_TOTAL
        .with_label_values(&[event_type, outcome])
        .inc();
}

pub fn record_recovery(path: &str, outcome: &str) {
    RECOVERIES_TOTAL.with_label_values(&[path, outcome]).inc();
}

pub fn record_receipt(outcome: &str) {
    RECEIPTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_gateway_call(operation: &str, outcome: &str, duration_secs: f64) {
    GATEWAY_CALL_DURATION
        .with_label_values(&[operation, outcome])
        .observe(duration_secs);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
