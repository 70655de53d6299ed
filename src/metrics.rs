//! Prometheus metrics for relayed requests.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::debug;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder (once per process) and return its handle.
///
/// Later calls return the same handle, so several routers built in one
/// process (tests) share one registry.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            // Fails only if another recorder is installed, in which case our
            // handle renders an empty registry
            if let Err(e) = metrics::set_global_recorder(recorder) {
                debug!("Prometheus recorder not installed: {}", e);
            }
            handle
        })
        .clone()
}

/// Count a finished request by endpoint and status code.
pub fn record_request(endpoint: &'static str, status: u16) {
    metrics::counter!(
        "hls_relay_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record time to response headers for an endpoint.
pub fn record_duration(endpoint: &'static str, start: Instant) {
    metrics::histogram!("hls_relay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(endpoint: &'static str) {
    metrics::counter!("hls_relay_upstream_errors_total", "endpoint" => endpoint).increment(1);
}

pub fn record_playlist_rewritten() {
    metrics::counter!("hls_relay_playlists_rewritten_total").increment(1);
}
