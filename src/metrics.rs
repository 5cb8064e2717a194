//! Prometheus metrics for pipeline observability.
//!
//! Metrics are recorded by the policy layers and exposed via a dedicated
//! HTTP endpoint when the exporter is installed (demo server, default port
//! 9090).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `turnpike_requests_total` - Completed requests (labels: method, status)
//! - `turnpike_short_circuits_total` - Requests answered by a policy layer
//!   before reaching the handler (label: layer = cors_preflight | rate_limit
//!   | validation | auth)
//! - `turnpike_errors_total` - Errors caught by the normalizer (label: kind)
//!
//! ## Histograms
//! - `turnpike_request_duration_seconds` - Wall time per request
//!
//! ## Gauges
//! - `turnpike_rate_limit_keys` - Live keys in the counter store

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "turnpike_requests_total";
    pub const SHORT_CIRCUITS_TOTAL: &str = "turnpike_short_circuits_total";
    pub const ERRORS_TOTAL: &str = "turnpike_errors_total";
    pub const REQUEST_DURATION_SECONDS: &str = "turnpike_request_duration_seconds";
    pub const RATE_LIMIT_KEYS: &str = "turnpike_rate_limit_keys";
}

/// Register metric descriptions. Call once at startup.
pub fn init_metrics() {
    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total requests completed by composed pipelines"
    );
    describe_counter!(
        names::SHORT_CIRCUITS_TOTAL,
        "Requests answered by a policy layer before the terminal handler"
    );
    describe_counter!(
        names::ERRORS_TOTAL,
        "Errors caught and normalized at the pipeline boundary"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Request duration through the composed pipeline in seconds"
    );
    describe_gauge!(
        names::RATE_LIMIT_KEYS,
        "Live keys in the rate-limit counter store"
    );
}

/// Install the Prometheus exporter on its own listener.
///
/// Must be called from within a Tokio runtime. Failure is logged and
/// returned; the caller decides whether metrics are fatal.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| {
            error!("Failed to install Prometheus exporter: {e}");
            anyhow::anyhow!("metrics exporter install failed: {e}")
        })?;

    info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(())
}

/// Record a completed request with its final status.
pub fn record_request(method: &str, status: u16) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record a request answered by a policy layer before the handler.
pub fn record_short_circuit(layer: &'static str) {
    counter!(names::SHORT_CIRCUITS_TOTAL, "layer" => layer).increment(1);
}

/// Record an error caught by the normalizer.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record a request's wall time.
pub fn record_request_duration(seconds: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS).record(seconds);
}

/// Record the current size of a rate-limit store.
pub fn record_store_size(keys: usize) {
    // Precision loss above 2^52 keys is acceptable for a gauge
    #[allow(clippy::cast_precision_loss)]
    gauge!(names::RATE_LIMIT_KEYS).set(keys as f64);
}
