//! `send(identity, message)`: first write plus retry tracking.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Serialize;
use tether_core::{Identity, Message, MessageError, MessageId, TransportError};
use tracing::{debug, error, warn};

use crate::connection::{CloseReason, Connection};
use crate::hub::DeliveryHub;
use crate::metrics::{MESSAGES_FAILED_TOTAL, MESSAGES_OFFLINE_TOTAL, MESSAGES_SENT_TOTAL};
use crate::retry::{Redeliver, RedeliveryOutcome};

/// Receipt for a message written to a live connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    /// Id the client must acknowledge.
    pub message_id: MessageId,
    /// Whether the message awaits acknowledgment.
    pub tracked: bool,
}

/// Why a send did not reach the client.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Empty target identity.
    #[error("invalid identity")]
    InvalidIdentity,
    /// The message failed validation.
    #[error(transparent)]
    InvalidMessage(#[from] MessageError),
    /// No live connection. Nothing was tracked.
    #[error("{identity} is offline")]
    Offline {
        /// Target.
        identity: Identity,
    },
    /// The write failed and the connection was torn down.
    #[error("delivery to {identity} failed: {source}")]
    DeliveryFailed {
        /// Target.
        identity: Identity,
        /// Transport failure.
        source: TransportError,
    },
    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SendError {
    /// Short classification string.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentity => "invalid_identity",
            Self::InvalidMessage(_) => "invalid_message",
            Self::Offline { .. } => "offline",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Encode(_) => "encode",
        }
    }

    /// HTTP status for the push endpoint.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidIdentity | Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::Offline { .. } => StatusCode::NOT_FOUND,
            Self::DeliveryFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for SendError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error_kind(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl DeliveryHub {
    /// Write `message` to the live connection of `identity`.
    ///
    /// Assigns a `message_id` when absent. Non-ack messages are tracked under
    /// `(identity, message_id)` before the first write, so an ack that beats
    /// the write's return still settles them; the redelivery timer starts
    /// only after the write succeeds. An offline identity is an error and
    /// nothing is tracked.
    pub async fn send(&self, identity: &str, mut message: Message) -> Result<Delivery, SendError> {
        let identity = Identity::parse(identity).map_err(|_| SendError::InvalidIdentity)?;
        message.validate()?;
        let message_id = message.message_id.get_or_insert_with(MessageId::new).clone();
        message.target_identity = Some(identity.clone());

        let Some(conn) = self.registry().get(&identity) else {
            counter!(MESSAGES_OFFLINE_TOTAL).increment(1);
            debug!(%identity, %message_id, "recipient offline");
            return Err(SendError::Offline { identity });
        };

        let frame = message.encode()?;
        let tracking = self.retry().track(identity.clone(), message);
        if let Err(source) = self.write_or_teardown(&conn, frame, || true).await {
            if let Some(tracking) = tracking {
                self.retry().abandon(tracking);
            }
            return Err(SendError::DeliveryFailed { identity, source });
        }
        counter!(MESSAGES_SENT_TOTAL).increment(1);

        if let Some(tracking) = &tracking {
            self.retry().arm(tracking);
        }
        Ok(Delivery {
            message_id,
            tracked: tracking.is_some(),
        })
    }

    /// Write through [`Connection::write_if`]; a failure tears the connection down.
    async fn write_or_teardown<F>(
        &self,
        conn: &Arc<Connection>,
        frame: String,
        proceed: F,
    ) -> Result<bool, TransportError>
    where
        F: FnOnce() -> bool + Send,
    {
        let e = match conn.write_if(frame, proceed).await {
            Ok(written) => return Ok(written),
            Err(e) => e,
        };
        counter!(MESSAGES_FAILED_TOTAL, "kind" => e.error_kind()).increment(1);
        warn!(
            identity = %conn.identity(),
            session_id = %conn.session_id(),
            error = %e,
            kind = e.error_kind(),
            "write failed, closing connection"
        );
        self.teardown(conn, CloseReason::WriteFailed).await;
        Err(e)
    }
}

#[async_trait]
impl Redeliver for DeliveryHub {
    async fn redeliver(
        &self,
        target: &Identity,
        message: &Message,
        still_pending: &(dyn Fn() -> bool + Send + Sync),
    ) -> RedeliveryOutcome {
        let Some(conn) = self.registry().get(target) else {
            return RedeliveryOutcome::Offline;
        };
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(identity = %target, error = %e, "failed to encode redelivery");
                return RedeliveryOutcome::Failed;
            }
        };
        match self.write_or_teardown(&conn, frame, || still_pending()).await {
            Ok(true) => RedeliveryOutcome::Delivered,
            Ok(false) => RedeliveryOutcome::Skipped,
            Err(_) => RedeliveryOutcome::Failed,
        }
    }
}
