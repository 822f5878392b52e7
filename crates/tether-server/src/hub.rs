//! Shared owner of the registry, retry engine and presence notifier.

use std::sync::{Arc, Weak};

use metrics::{counter, gauge, histogram};
use tether_core::{DeadLetterSink, Identity, Message, MessageId, PresenceSink, SessionId};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::admission::Admission;
use crate::config::DeliveryConfig;
use crate::connection::{CloseReason, Connection, FrameWriter};
use crate::metrics::{
    INBOUND_FRAMES_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::presence::{LogPresenceSink, PresenceNotifier};
use crate::registry::ConnectionRegistry;
use crate::retry::{LogDeadLetters, Redeliver, RetryEngine};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// A non-ack frame received from a client.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Sender.
    pub identity: Identity,
    /// Session it arrived on.
    pub session_id: SessionId,
    /// Decoded frame.
    pub message: Message,
}

/// Owns every live connection and every pending delivery.
///
/// Admission, [`send`](DeliveryHub::send) and teardown all go through here so
/// that closing a connection, clearing its registry entry and dropping its
/// pending deliveries happen on one path.
pub struct DeliveryHub {
    config: DeliveryConfig,
    registry: ConnectionRegistry,
    retry: RetryEngine,
    presence: PresenceNotifier,
    inbound: broadcast::Sender<InboundMessage>,
}

impl DeliveryHub {
    /// Hub whose collaborators only log.
    pub fn new(config: DeliveryConfig) -> Arc<Self> {
        Self::with_sinks(config, Arc::new(LogPresenceSink), Arc::new(LogDeadLetters))
    }

    /// Hub with explicit presence and dead-letter sinks.
    pub fn with_sinks(
        config: DeliveryConfig,
        presence: Arc<dyn PresenceSink>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|hub: &Weak<Self>| {
            let redeliver: Weak<dyn Redeliver> = hub.clone();
            let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
            Self {
                config,
                registry: ConnectionRegistry::new(),
                retry: RetryEngine::new(config, redeliver, dead_letters),
                presence: PresenceNotifier::new(presence),
                inbound,
            }
        })
    }

    /// Delivery tuning.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Pending deliveries.
    pub fn retry(&self) -> &RetryEngine {
        &self.retry
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of messages awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.retry.len()
    }

    /// Whether `identity` currently has a live connection.
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.registry.contains(identity)
    }

    /// Receive every non-ack frame from every client.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    /// Register a freshly upgraded transport. Any previous connection for the
    /// same identity is closed before this one becomes visible.
    pub fn admit(
        &self,
        admission: Admission,
        remote_address: String,
        writer: Box<dyn FrameWriter>,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(admission, remote_address, writer, &self.config));
        let _ = conn.activate();
        if let Some(previous) = self.registry.put(Arc::clone(&conn)) {
            info!(
                identity = %conn.identity(),
                superseded = %previous.session_id(),
                session_id = %conn.session_id(),
                "replacing existing connection"
            );
        }

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(
            identity = %conn.identity(),
            session_id = %conn.session_id(),
            remote = %conn.remote_address(),
            platform = %conn.platform(),
            version = %conn.protocol_version(),
            "client connected"
        );
        self.presence.connected(&conn);
        conn
    }

    /// Acknowledge `message_id` on behalf of `identity`. Unknown ids, and ids
    /// pending for other identities, are ignored.
    pub fn confirm(&self, identity: &Identity, message_id: &MessageId) -> bool {
        self.retry.confirm(identity, message_id)
    }

    /// Forward a decoded non-ack frame to inbound subscribers.
    pub fn publish_inbound(&self, conn: &Connection, message: Message) {
        counter!(INBOUND_FRAMES_TOTAL, "kind" => "message").increment(1);
        let event = InboundMessage {
            identity: conn.identity().clone(),
            session_id: conn.session_id().clone(),
            message,
        };
        if self.inbound.send(event).is_err() {
            debug!(identity = %conn.identity(), "no inbound subscribers, frame dropped");
        }
    }

    /// The one teardown path. Safe to call from several places at once; only
    /// the first call closes the transport, touches the registry and emits
    /// the disconnect event.
    pub async fn teardown(&self, conn: &Arc<Connection>, reason: CloseReason) {
        let _ = conn.begin_close(reason);
        if !conn.finish_close().await {
            return;
        }
        let reason = conn.close_reason().unwrap_or(reason);

        if self.registry.remove(conn.identity(), conn.session_id()) {
            let dropped = self.retry.forget_identity(conn.identity());
            if dropped > 0 {
                debug!(identity = %conn.identity(), dropped, "dropped pending deliveries");
            }
        }

        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
        info!(
            identity = %conn.identity(),
            session_id = %conn.session_id(),
            %reason,
            "client disconnected"
        );
        self.presence.disconnected(conn, reason);
    }

    /// Ask every live connection to close. Their read loops finish teardown.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|conn| conn.begin_close(reason))
            .count()
    }
}
