//! Prometheus metrics for booking-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Booking transitions by transition name and outcome (ok, rejected).
pub static BOOKING_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_transitions_total",
        "Total number of booking state transitions attempted",
        &["transition", "outcome"]
    )
    .expect("Failed to register booking_transitions_total")
});

/// Settlement attempts by outcome (created, existing).
pub static SETTLEMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_settlements_total",
        "Total number of settlement attempts",
        &["outcome"]
    )
    .expect("Failed to register settlements_total")
});

/// Payment confirmations by entry point and outcome.
pub static PAYMENT_CONFIRMATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_payment_confirmations_total",
        "Payment confirmations by source (verify, webhook) and outcome",
        &["source", "outcome"]
    )
    .expect("Failed to register payment_confirmations_total")
});

/// Gateway calls by operation and status.
pub static GATEWAY_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_gateway_calls_total",
        "Payment gateway calls by operation and status",
        &["operation", "status"]
    )
    .expect("Failed to register gateway_calls_total")
});

/// Refund reversals that could not be debited.
pub static REFUND_SHORTFALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "booking_refund_shortfalls_total",
        "Refund reversals skipped for insufficient wallet balance",
        &["wallet"]  // owner, admin
    )
    .expect("Failed to register refund_shortfalls_total")
});

pub static STORE_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "booking_store_operation_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register store_operation_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&BOOKING_TRANSITIONS_TOTAL);
    Lazy::force(&SETTLEMENTS_TOTAL);
    Lazy::force(&PAYMENT_CONFIRMATIONS_TOTAL);
    Lazy::force(&GATEWAY_CALLS_TOTAL);
    Lazy::force(&REFUND_SHORTFALLS_TOTAL);
    Lazy::force(&STORE_OPERATION_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

pub fn record_transition(transition: &str, ok: bool) {
    BOOKING_TRANSITIONS_TOTAL
        .with_label_values(&[transition, if ok { "ok" } else { "rejected" }])
        .inc();
}
