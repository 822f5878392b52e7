//! # tether-core
//!
//! Shared vocabulary for the tether delivery engine.
//!
//! - [`ids`]: client identities plus process-unique session and message ids
//! - [`message`]: the JSON frame exchanged with clients
//! - [`presence`]: connect/disconnect events and the audit sink contract
//! - [`delivery`]: dead-letter records and their sink contract
//! - [`directory`]: service-directory registration contract
//! - [`errors`]: admission, transport and frame errors

#![deny(unsafe_code)]

pub mod delivery;
pub mod directory;
pub mod errors;
pub mod ids;
pub mod message;
pub mod presence;

pub use delivery::{DeadLetter, DeadLetterSink};
pub use directory::{HealthCheck, ServiceDirectory, ServiceRegistration};
pub use errors::{AdmissionError, DirectoryError, MessageError, SinkError, TransportError};
pub use ids::{Identity, MessageId, SessionId};
pub use message::{ACK_ACTION, Message};
pub use presence::{PresenceEvent, PresenceKind, PresenceSink};
