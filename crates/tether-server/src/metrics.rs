//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Admitted connections (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Torn-down connections (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrade requests rejected before upgrade (counter).
pub const ADMISSION_REJECTED_TOTAL: &str = "admission_rejected_total";
/// First-attempt writes that succeeded (counter).
pub const MESSAGES_SENT_TOTAL: &str = "messages_sent_total";
/// Sends to identities with no live connection (counter).
pub const MESSAGES_OFFLINE_TOTAL: &str = "messages_offline_total";
/// Writes that failed and tore the connection down (counter, labels: kind).
pub const MESSAGES_FAILED_TOTAL: &str = "messages_failed_total";
/// Redelivery writes that succeeded (counter).
pub const REDELIVERIES_TOTAL: &str = "redeliveries_total";
/// Acknowledgments that cleared a pending entry (counter).
pub const ACKS_TOTAL: &str = "acks_total";
/// Messages that exhausted their attempts (counter).
pub const DEAD_LETTERS_TOTAL: &str = "dead_letters_total";
/// Pending deliveries awaiting acknowledgment (gauge).
pub const PENDING_DELIVERIES: &str = "pending_deliveries";
/// Inbound frames decoded (counter, labels: kind).
pub const INBOUND_FRAMES_TOTAL: &str = "inbound_frames_total";
