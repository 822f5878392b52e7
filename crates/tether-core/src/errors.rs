//! Error types shared across the delivery engine.

use std::time::Duration;

/// Why an upgrade request could not be bound to an identity.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The `id` parameter was absent or empty.
    #[error("missing identity")]
    MissingIdentity,
}

/// Failures of the underlying bidirectional transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is closing or already closed.
    #[error("connection closed")]
    Closed,
    /// A frame could not be written.
    #[error("write failed: {0}")]
    Write(String),
    /// A frame write did not complete in time.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    /// The read side reported an error.
    #[error("read failed: {0}")]
    Read(String),
    /// The protocol upgrade did not complete.
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl TransportError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Write(_) => "write",
            Self::WriteTimeout(_) => "write_timeout",
            Self::Read(_) => "read",
            Self::Upgrade(_) => "upgrade",
        }
    }
}

/// Frame validation and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// `action` was empty.
    #[error("message action must not be empty")]
    EmptyAction,
    /// The frame was not a valid message.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Binary frame that is not UTF-8.
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// A collaborator sink rejected or failed to store a record.
#[derive(Debug, thiserror::Error)]
#[error("{sink} sink failed: {message}")]
pub struct SinkError {
    /// Which sink failed (for logs).
    pub sink: &'static str,
    /// Failure detail.
    pub message: String,
}

impl SinkError {
    /// Build a sink error.
    pub fn new(sink: &'static str, message: impl Into<String>) -> Self {
        Self {
            sink,
            message: message.into(),
        }
    }
}

/// Service-directory registration failures.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory could not be reached.
    #[error("directory unreachable: {0}")]
    Unreachable(String),
    /// The directory answered with a non-success status.
    #[error("directory rejected registration ({status}): {body}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
        /// Response body.
        body: String,
    },
}
