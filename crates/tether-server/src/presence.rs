//! Presence notifications to the audit collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{PresenceEvent, PresenceKind, PresenceSink, SinkError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, Connection};

/// Emits connect/disconnect events without blocking the connection path.
///
/// Events are recorded one at a time, in emission order, by a single worker
/// task, so a session's disconnect never lands before its connect.
#[derive(Clone)]
pub struct PresenceNotifier {
    events: mpsc::UnboundedSender<PresenceEvent>,
}

impl PresenceNotifier {
    /// Wrap a sink and start its worker. Must be called inside a Tokio runtime.
    pub fn new(sink: Arc<dyn PresenceSink>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = tokio::spawn(record_in_order(sink, rx));
        Self { events }
    }

    /// `conn` was admitted.
    pub fn connected(&self, conn: &Connection) {
        self.emit(PresenceEvent::new(
            conn.identity().clone(),
            conn.session_id().clone(),
            PresenceKind::Connected,
            "Connected",
        ));
    }

    /// `conn` was torn down.
    pub fn disconnected(&self, conn: &Connection, reason: CloseReason) {
        self.emit(PresenceEvent::new(
            conn.identity().clone(),
            conn.session_id().clone(),
            PresenceKind::Disconnected,
            format!("Disconnected: {reason}"),
        ));
    }

    fn emit(&self, event: PresenceEvent) {
        if let Err(mpsc::error::SendError(event)) = self.events.send(event) {
            debug!(identity = %event.identity, "presence worker gone, event dropped");
        }
    }
}

async fn record_in_order(sink: Arc<dyn PresenceSink>, mut events: mpsc::UnboundedReceiver<PresenceEvent>) {
    while let Some(event) = events.recv().await {
        let identity = event.identity.clone();
        let kind = event.kind;
        if let Err(e) = sink.record(event).await {
            warn!(%identity, kind = kind.as_str(), error = %e, "failed to record presence");
        }
    }
}

/// Presence sink that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPresenceSink;

#[async_trait]
impl PresenceSink for LogPresenceSink {
    async fn record(&self, event: PresenceEvent) -> Result<(), SinkError> {
        info!(
            identity = %event.identity,
            session_id = %event.session_id,
            kind = event.kind.as_str(),
            body = %event.body,
            "presence"
        );
        Ok(())
    }
}
