//! Dead-letter records for messages that exhausted their retry budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SinkError;
use crate::ids::Identity;
use crate::message::Message;

/// A message that was never acknowledged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Intended recipient.
    pub target_identity: Identity,
    /// The message as last sent.
    pub message: Message,
    /// Writes performed before giving up.
    pub attempts: u32,
    /// When tracking began.
    pub first_enqueued_at: DateTime<Utc>,
    /// When tracking ended.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Terminal destination for unacknowledged messages.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store one dead letter.
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), SinkError>;
}
