//! Prometheus metrics for metering operations.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder, histogram_opts, opts,
    register_histogram_vec, register_int_counter_vec,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Validation decisions counter
pub static USAGE_VALIDATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Commit outcomes counter
pub static USAGE_COMMITS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Rate limit denials by window
pub static RATE_LIMIT_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Pending reservations swept to expired
pub static USAGE_EXPIRED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    USAGE_VALIDATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_validations_total",
                "Total usage validations by decision"
            ),
            &["decision"]
        )
        .expect("Failed to register USAGE_VALIDATIONS_TOTAL")
    });

    USAGE_COMMITS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_commits_total",
                "Total usage commits by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register USAGE_COMMITS_TOTAL")
    });

    RATE_LIMIT_DENIALS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_rate_limit_denials_total",
                "Total rate limit denials by window"
            ),
            &["window"]
        )
        .expect("Failed to register RATE_LIMIT_DENIALS_TOTAL")
    });

    USAGE_EXPIRED_TOTAL.get_or_init(|| {
        prometheus::register_int_counter!(prometheus::opts!(
            "metering_usage_expired_total",
            "Total pending reservations swept to expired"
        ))
        .expect("Failed to register USAGE_EXPIRED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a validation decision ("granted", "denied_rate_limit",
/// "denied_quota", "replayed").
pub fn record_validation(decision: &str) {
    if let Some(counter) = USAGE_VALIDATIONS_TOTAL.get() {
        counter.with_label_values(&[decision]).inc();
    }
}

/// Record a commit outcome ("success", "failed", "replayed", "not_found").
pub fn record_commit(outcome: &str) {
    if let Some(counter) = USAGE_COMMITS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a rate limit denial for a window ("minute" or "day").
pub fn record_rate_limit_denial(window: &str) {
    if let Some(counter) = RATE_LIMIT_DENIALS_TOTAL.get() {
        counter.with_label_values(&[window]).inc();
    }
}

/// Record swept reservations.
pub fn record_expired(count: u64) {
    if let Some(counter) = USAGE_EXPIRED_TOTAL.get() {
        counter.inc_by(count);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
