//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `GET /metrics`. Call once at startup,
/// before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle that renders without being installed globally (tests, embedding).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Outbound writes, each carrying one or more coalesced frames (counter).
pub const WS_WRITES_TOTAL: &str = "ws_writes_total";
/// Frames per outbound write (histogram).
pub const WS_FRAMES_PER_WRITE: &str = "ws_frames_per_write";
/// Inbound frames that failed to decode or route (counter, labels: code).
pub const WS_INBOUND_ERRORS_TOTAL: &str = "ws_inbound_errors_total";
/// Admissions refused at the connection cap (counter).
pub const REGISTRY_SATURATED_TOTAL: &str = "registry_saturated_total";
/// Connections evicted (counter, labels: reason).
pub const REGISTRY_EVICTIONS_TOTAL: &str = "registry_evictions_total";
/// Registered local connections (gauge).
pub const REGISTRY_CONNECTIONS: &str = "registry_connections";
/// Broadcast frames skipped because a queue was full (counter).
pub const REGISTRY_BROADCAST_DROPS_TOTAL: &str = "registry_broadcast_drops_total";
/// Presence entries reaped from dead processes (counter).
pub const PRESENCE_REAPED_TOTAL: &str = "presence_reaped_total";
/// Chat events persisted and published (counter, labels: kind).
pub const CHAT_MESSAGES_TOTAL: &str = "chat_messages_total";
/// Chat events rejected (counter, labels: code).
pub const CHAT_FAILURES_TOTAL: &str = "chat_failures_total";
