//! The JSON frame exchanged with clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::MessageError;
use crate::ids::{Identity, MessageId};

/// Reserved action confirming receipt of a prior `message_id`. Never retried.
pub const ACK_ACTION: &str = "reply";

/// A unit of application payload.
///
/// Wire shape: `{"action": "...", "body": ..., "message_id": "...", "created_at": "..."}`.
/// Only `action` is required on inbound frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Discriminator. [`ACK_ACTION`] marks an acknowledgment.
    pub action: String,
    /// Opaque application payload.
    #[serde(default)]
    pub body: Value,
    /// Assigned by the dispatcher when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Set by the dispatcher on outbound frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_identity: Option<Identity>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with no id yet.
    pub fn new(action: impl Into<String>, body: Value) -> Self {
        Self {
            action: action.into(),
            body,
            message_id: None,
            target_identity: None,
            created_at: Utc::now(),
        }
    }

    /// Acknowledgment for `message_id`.
    pub fn ack(message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..Self::new(ACK_ACTION, Value::Null)
        }
    }

    /// Set an explicit id.
    #[must_use]
    pub fn with_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Whether this frame is an acknowledgment.
    pub fn is_ack(&self) -> bool {
        self.action == ACK_ACTION
    }

    /// Reject frames without an action.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.action.is_empty() {
            return Err(MessageError::EmptyAction);
        }
        Ok(())
    }

    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    /// Parse and validate a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(data: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(data).map_err(|_| MessageError::NotUtf8)?;
        Self::decode(text)
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
