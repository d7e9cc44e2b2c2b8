//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Requests**: Counts and latency of inbound RPCs by method and code
//! - **Admission**: Rate-limit rejections and recovered panics
//! - **Resilience**: Circuit breaker transitions and retry attempts
//! - **Catalog**: Size of the market registry
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Until
//! [`init_metrics`] runs, recording is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns [`BuildError`] if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "spot_service_requests_total",
        "Total inbound RPCs by method and status code"
    );
    describe_histogram!(
        "spot_service_request_duration_seconds",
        "Inbound RPC latency including pipeline stages"
    );
    describe_counter!(
        "spot_service_rate_limited_total",
        "Inbound RPCs rejected by the rate limiter"
    );
    describe_counter!(
        "spot_service_panics_recovered_total",
        "Handler panics converted into internal errors"
    );
    describe_counter!(
        "spot_service_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "spot_service_retries_total",
        "Outbound call retries after a retryable failure"
    );
    describe_gauge!(
        "spot_service_markets_available",
        "Markets currently enabled and not deleted"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a completed inbound RPC.
pub fn record_request(method: &str, code: tonic::Code, duration: Duration) {
    counter!(
        "spot_service_requests_total",
        "method" => method.to_string(),
        "code" => format!("{code:?}")
    )
    .increment(1);
    histogram!(
        "spot_service_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a rate-limit rejection.
pub fn record_rate_limited(method: &str) {
    counter!(
        "spot_service_rate_limited_total",
        "method" => method.to_string()
    )
    .increment(1);
}

/// Record a recovered handler panic.
pub fn record_panic_recovered(method: &str) {
    counter!(
        "spot_service_panics_recovered_total",
        "method" => method.to_string()
    )
    .increment(1);
}

/// Record a circuit breaker transition.
pub fn record_breaker_transition(breaker: &str, from: &'static str, to: &'static str) {
    counter!(
        "spot_service_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

/// Record an outbound retry.
pub fn record_retry(breaker: &str) {
    counter!(
        "spot_service_retries_total",
        "breaker" => breaker.to_string()
    )
    .increment(1);
}

/// Update the available-market gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_markets_available(count: usize) {
    gauge!("spot_service_markets_available").set(count as f64);
}
