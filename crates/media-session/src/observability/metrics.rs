//! Metrics definitions for the media session layer.
//!
//! All metrics follow Prometheus naming conventions:
//! - `ms_` prefix for media session
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: fixed set of core operations (~15 values)
//! - `reason`: transport close reasons (5 values)
//! - `direction`: PTT transitions (2 values)
//! - `error_type`: [`crate::errors::SessionError::error_type`] labels (6 values)
//!
//! Channel, user and resource ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Operation latency
/// buckets target engine round trips in the low milliseconds.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("ms_operation".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set operation latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Resource Gauges
// ============================================================================

/// Metric: `ms_workers_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_workers_active(count: usize) {
    gauge!("ms_workers_active").set(count as f64);
}

/// Metric: `ms_routers_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_routers_active(count: usize) {
    gauge!("ms_routers_active").set(count as f64);
}

/// Metric: `ms_transports_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_transports_active(count: usize) {
    gauge!("ms_transports_active").set(count as f64);
}

/// Metric: `ms_producers_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_producers_active(count: usize) {
    gauge!("ms_producers_active").set(count as f64);
}

/// Metric: `ms_consumers_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_consumers_active(count: usize) {
    gauge!("ms_consumers_active").set(count as f64);
}

// ============================================================================
// Lifecycle Counters
// ============================================================================

/// Record a transport close.
///
/// Metric: `ms_transport_closed_total`
/// Labels: `reason` (explicit, user_disconnect, channel_teardown, dtls_failed, engine_closed)
pub fn record_transport_closed(reason: &'static str) {
    counter!("ms_transport_closed_total", "reason" => reason).increment(1);
}

/// Record a PTT gate transition that reached the engine.
///
/// Metric: `ms_ptt_transitions_total`
/// Labels: `direction` (resume, pause)
pub fn record_ptt_transition(direction: &'static str) {
    counter!("ms_ptt_transitions_total", "direction" => direction).increment(1);
}

/// Record an unexpected media worker death.
///
/// Metric: `ms_worker_deaths_total`
pub fn record_worker_death() {
    counter!("ms_worker_deaths_total").increment(1);
}

/// Record a failed operation.
///
/// Metric: `ms_errors_total`
/// Labels: `operation`, `error_type`, `status_code`
pub fn record_error(operation: &'static str, error_type: &'static str, status_code: i32) {
    counter!("ms_errors_total",
        "operation" => operation,
        "error_type" => error_type,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

// ============================================================================
// Latency
// ============================================================================

/// Record how long a core operation took, including engine round trips.
///
/// Metric: `ms_operation_duration_seconds`
/// Labels: `operation`
pub fn record_operation_duration(operation: &'static str, duration: Duration) {
    histogram!("ms_operation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}
