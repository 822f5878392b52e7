//! Per-connection read loop with a sliding idle deadline.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{Stream, StreamExt};
use metrics::counter;
use tether_core::{Message, TransportError};
use tracing::{debug, info, instrument, warn};

use crate::admission::Admission;
use crate::connection::{CloseReason, Connection};
use crate::hub::DeliveryHub;
use crate::metrics::INBOUND_FRAMES_TOTAL;

/// One inbound transport frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Text frame.
    Text(String),
    /// Binary frame, expected to carry UTF-8 JSON.
    Binary(Vec<u8>),
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
    /// Close frame.
    Close,
}

impl From<WsMessage> for Inbound {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(text) => Self::Text(text.as_str().to_owned()),
            WsMessage::Binary(data) => Self::Binary(data.to_vec()),
            WsMessage::Ping(_) => Self::Ping,
            WsMessage::Pong(_) => Self::Pong,
            WsMessage::Close(_) => Self::Close,
        }
    }
}

/// Drive an upgraded socket from admission to teardown.
pub async fn serve_socket(
    hub: Arc<DeliveryHub>,
    socket: WebSocket,
    admission: Admission,
    remote_address: String,
) {
    let (sink, stream) = socket.split();
    let conn = hub.admit(admission, remote_address, Box::new(sink));
    let frames = stream.map(|frame| {
        frame
            .map(Inbound::from)
            .map_err(|e| TransportError::Read(e.to_string()))
    });
    let _ = run_read_loop(&hub, &conn, frames).await;
}

/// Read frames until the connection ends, then tear it down.
///
/// Every frame, control frames included, pushes the idle deadline forward.
/// Acknowledgments clear pending deliveries; other frames go to inbound
/// subscribers. Returns the reason the connection closed.
#[instrument(skip_all, fields(identity = %conn.identity(), session_id = %conn.session_id()))]
pub async fn run_read_loop<S>(hub: &DeliveryHub, conn: &Arc<Connection>, mut frames: S) -> CloseReason
where
    S: Stream<Item = Result<Inbound, TransportError>> + Unpin,
{
    let idle_timeout = hub.config().idle_timeout;
    conn.reset_deadline(idle_timeout);

    let reason = loop {
        let deadline = conn.deadline();
        let next = tokio::select! {
            biased;
            () = conn.closing() => break conn.close_reason().unwrap_or(CloseReason::Shutdown),
            next = tokio::time::timeout_at(deadline, frames.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(timeout_secs = idle_timeout.as_secs(), "idle deadline expired");
                break CloseReason::IdleTimeout;
            }
            Ok(None) => break CloseReason::PeerClosed,
            Ok(Some(Err(e))) => {
                info!(error = %e, "read failed");
                break CloseReason::ReadError;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        conn.reset_deadline(idle_timeout);

        let decoded = match frame {
            Inbound::Ping | Inbound::Pong => continue,
            Inbound::Close => {
                debug!("client sent close frame");
                break CloseReason::PeerClosed;
            }
            Inbound::Text(text) => Message::decode(&text),
            Inbound::Binary(data) => Message::decode_bytes(&data),
        };
        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed frame");
                break CloseReason::MalformedFrame;
            }
        };

        if message.is_ack() {
            let Some(message_id) = message.message_id else {
                warn!("acknowledgment without message_id");
                break CloseReason::MalformedFrame;
            };
            counter!(INBOUND_FRAMES_TOTAL, "kind" => "ack").increment(1);
            if !hub.confirm(conn.identity(), &message_id) {
                debug!(%message_id, "acknowledgment for unknown message");
            }
        } else {
            hub.publish_inbound(conn, message);
        }
    };

    hub.teardown(conn, reason).await;
    reason
}
