//! One live transport session and its lifecycle.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures::SinkExt;
use futures::stream::SplitSink;
use parking_lot::Mutex;
use tether_core::{Identity, SessionId, TransportError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::admission::Admission;
use crate::config::DeliveryConfig;

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, not yet visible to lookups.
    Admitting,
    /// Registered and writable.
    Active,
    /// Teardown requested; writes are refused.
    Closing,
    /// Transport closed. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Admitting, Self::Active | Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Why a connection was torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or ended the stream.
    PeerClosed,
    /// No inbound frame before the deadline.
    IdleTimeout,
    /// The read side failed.
    ReadError,
    /// An inbound frame could not be decoded.
    MalformedFrame,
    /// An outbound write failed.
    WriteFailed,
    /// A newer connection for the same identity was admitted.
    Superseded,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::ReadError => "read_error",
            Self::MalformedFrame => "malformed_frame",
            Self::WriteFailed => "write_failed",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one text frame.
    async fn write_text(&mut self, text: String) -> Result<(), TransportError>;
    /// Close the transport. Errors are swallowed: the peer may already be gone.
    async fn close(&mut self);
}

#[async_trait]
impl FrameWriter for SplitSink<WebSocket, WsMessage> {
    async fn write_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

struct Lifecycle {
    state: ConnectionState,
    reason: Option<CloseReason>,
}

/// A live session owned by one identity.
///
/// State changes go through [`Connection::transition`]; whichever of the read
/// loop, a failed write or a superseding admission closes first wins, and later
/// attempts are no-ops.
pub struct Connection {
    identity: Identity,
    session_id: SessionId,
    remote_address: String,
    platform: String,
    protocol_version: String,
    connected_at: DateTime<Utc>,
    opened: Instant,
    lifecycle: Mutex<Lifecycle>,
    deadline: Mutex<Instant>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameWriter>>>,
    closing: CancellationToken,
    write_timeout: Duration,
}

impl Connection {
    /// Build a connection in `Admitting` with its idle deadline armed.
    pub fn new(
        admission: Admission,
        remote_address: String,
        writer: Box<dyn FrameWriter>,
        config: &DeliveryConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            identity: admission.identity,
            session_id: SessionId::new(),
            remote_address,
            platform: admission.platform,
            protocol_version: admission.version,
            connected_at: Utc::now(),
            opened: now,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Admitting,
                reason: None,
            }),
            deadline: Mutex::new(now + config.idle_timeout),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closing: CancellationToken::new(),
            write_timeout: config.write_timeout,
        }
    }

    /// Owning identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Process-unique session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Peer address captured at admission.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Client platform.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Client protocol version.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Wall-clock admission time.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time since admission.
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    /// Reason recorded by the first close request.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().reason
    }

    /// Apply a transition if legal. Returns whether it happened.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.can_transition_to(next) {
            lifecycle.state = next;
            true
        } else {
            false
        }
    }

    /// `Admitting -> Active`.
    pub fn activate(&self) -> bool {
        self.transition(ConnectionState::Active)
    }

    /// Request teardown. The first caller records its reason and wakes the read loop.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.state.can_transition_to(ConnectionState::Closing) {
                return false;
            }
            lifecycle.state = ConnectionState::Closing;
            lifecycle.reason = Some(reason);
        }
        self.closing.cancel();
        true
    }

    /// `Closing -> Closed` and close the transport. Only one caller gets `true`.
    pub async fn finish_close(&self) -> bool {
        if !self.transition(ConnectionState::Closed) {
            return false;
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.write_timeout, writer.close()).await;
        }
        true
    }

    /// Resolves once teardown has been requested.
    pub fn closing(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }

    /// Whether teardown has been requested.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Current idle deadline.
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Push the idle deadline to `now + idle_timeout`.
    pub fn reset_deadline(&self, idle_timeout: Duration) {
        *self.deadline.lock() = Instant::now() + idle_timeout;
    }

    /// Write one frame. Writes are serialized per connection and refused
    /// unless the connection is `Active`.
    pub async fn write(&self, text: String) -> Result<(), TransportError> {
        self.write_if(text, || true).await.map(|_written| ())
    }

    /// Like [`write`](Self::write), but `proceed` is evaluated once the writer
    /// is held. `Ok(false)` means it declined and nothing was written.
    pub async fn write_if<F>(&self, text: String, proceed: F) -> Result<bool, TransportError>
    where
        F: FnOnce() -> bool + Send,
    {
        let mut guard = self.writer.lock().await;
        if self.state() != ConnectionState::Active {
            return Err(TransportError::Closed);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        if !proceed() {
            return Ok(false);
        }
        match tokio::time::timeout(self.write_timeout, writer.write_text(text)).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("session_id", &self.session_id)
            .field("remote_address", &self.remote_address)
            .field("platform", &self.platform)
            .field("protocol_version", &self.protocol_version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::testing;

    fn make_connection() -> (Connection, testing::WriterTap) {
        let (writer, tap) = testing::writer();
        let conn = Connection::new(
            testing::admission("u1"),
            "10.0.0.1:5000".into(),
            writer,
            &testing::config(),
        );
        (conn, tap)
    }

    #[test]
    fn legal_transitions() {
        use ConnectionState::{Active, Admitting, Closed, Closing};
        assert!(Admitting.can_transition_to(Active));
        assert!(Admitting.can_transition_to(Closing));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Active.can_transition_to(Active));
        assert!(!Closing.can_transition_to(Closing));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
    }

    #[tokio::test]
    async fn new_connection_carries_admission_metadata() {
        let (conn, _tap) = make_connection();
        assert_eq!(conn.identity().as_str(), "u1");
        assert_eq!(conn.platform(), "iOS");
        assert_eq!(conn.protocol_version(), "1.0.1");
        assert_eq!(conn.remote_address(), "10.0.0.1:5000");
        assert_eq!(conn.state(), ConnectionState::Admitting);
        assert!(conn.session_id().as_str().starts_with("sess_"));
    }

    #[tokio::test]
    async fn write_refused_until_active() {
        let (conn, mut tap) = make_connection();
        assert_eq!(conn.write("x".into()).await, Err(TransportError::Closed));
        assert!(conn.activate());
        conn.write("hello".into()).await.unwrap();
        assert_eq!(tap.raw_frames(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let (conn, tap) = make_connection();
        let _ = conn.activate();
        tap.set_failing();
        let err = conn.write("x".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::Write(_)));
    }

    #[tokio::test]
    async fn declined_write_leaves_transport_untouched() {
        let (conn, mut tap) = make_connection();
        let _ = conn.activate();
        assert_eq!(conn.write_if("skip".into(), || false).await, Ok(false));
        assert_eq!(conn.write_if("send".into(), || true).await, Ok(true));
        assert_eq!(tap.raw_frames(), vec!["send".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn condition_is_checked_after_waiting_for_the_writer() {
        let (conn, mut tap) = make_connection();
        let conn = Arc::new(conn);
        let _ = conn.activate();
        let gate = tap.hold();
        let settled = Arc::new(AtomicBool::new(false));

        let busy = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.write("busy".into()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiting = tokio::spawn({
            let conn = Arc::clone(&conn);
            let settled = Arc::clone(&settled);
            async move {
                conn.write_if("late".into(), move || !settled.load(Ordering::SeqCst))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        settled.store(true, Ordering::SeqCst);
        drop(gate);

        busy.await.unwrap().unwrap();
        assert_eq!(waiting.await.unwrap(), Ok(false));
        assert_eq!(tap.raw_frames(), vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn first_close_wins() {
        let (conn, tap) = make_connection();
        let _ = conn.activate();
        assert!(conn.begin_close(CloseReason::IdleTimeout));
        assert!(!conn.begin_close(CloseReason::WriteFailed));
        assert_eq!(conn.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(conn.is_closing());

        assert!(conn.finish_close().await);
        assert!(!conn.finish_close().await);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(tap.is_closed());
        assert_eq!(tap.close_count(), 1);
    }

    #[tokio::test]
    async fn writes_refused_after_close_requested() {
        let (conn, _tap) = make_connection();
        let _ = conn.activate();
        let _ = conn.begin_close(CloseReason::Superseded);
        assert_eq!(conn.write("late".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn closing_future_resolves_after_begin_close() {
        let (conn, _tap) = make_connection();
        let _ = conn.activate();
        let _ = conn.begin_close(CloseReason::Shutdown);
        conn.closing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reset_moves_forward() {
        let (conn, _tap) = make_connection();
        let idle = testing::config().idle_timeout;
        let first = conn.deadline();
        assert_eq!(first, Instant::now() + idle);

        tokio::time::advance(Duration::from_secs(5)).await;
        conn.reset_deadline(idle);
        assert_eq!(conn.deadline(), first + Duration::from_secs(5));
    }

    #[test]
    fn close_reason_labels() {
        assert_eq!(CloseReason::IdleTimeout.to_string(), "idle_timeout");
        assert_eq!(CloseReason::Superseded.as_str(), "superseded");
        assert_eq!(CloseReason::MalformedFrame.as_str(), "malformed_frame");
    }
}
