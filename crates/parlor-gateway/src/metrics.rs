//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// API requests total (counter, labels: api).
pub const API_REQUESTS_TOTAL: &str = "api_requests_total";
/// API errors total (counter, labels: api, code).
pub const API_ERRORS_TOTAL: &str = "api_errors_total";
/// API request duration seconds (histogram, labels: api).
pub const API_REQUEST_DURATION_SECONDS: &str = "api_request_duration_seconds";
/// `WebSocket` connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// `WebSocket` disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active `WebSocket` connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Session lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Forced closes (counter, labels: reason).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Events fanned out (counter, labels: shape).
pub const BROADCAST_EVENTS_TOTAL: &str = "broadcast_events_total";
/// Frames dropped because a connection's queue was full or closed (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";
