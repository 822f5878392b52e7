//! Connect/disconnect events for the external audit collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SinkError;
use crate::ids::{Identity, SessionId};

/// Presence transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    /// A session was admitted.
    Connected,
    /// A session was torn down.
    Disconnected,
}

impl PresenceKind {
    /// Stable string form used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

/// One presence record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// Owning identity.
    pub identity: Identity,
    /// Session that changed state.
    pub session_id: SessionId,
    /// Transition.
    pub kind: PresenceKind,
    /// Human-readable detail.
    pub body: String,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl PresenceEvent {
    /// Build an event stamped now.
    pub fn new(
        identity: Identity,
        session_id: SessionId,
        kind: PresenceKind,
        body: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            session_id,
            kind,
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Receives presence events. Fire-and-forget from the caller's view: errors
/// are logged and never affect the connection.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    /// Store one event.
    async fn record(&self, event: PresenceEvent) -> Result<(), SinkError>;
}
