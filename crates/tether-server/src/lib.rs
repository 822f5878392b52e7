//! # tether-server
//!
//! Live per-identity WebSocket connections with tracked delivery.
//!
//! - [`registry`]: identity → single live connection, replace-and-close on re-admission
//! - [`admission`]: binds an upgrade request to identity, platform and version
//! - [`session`]: per-connection read loop with a sliding idle deadline
//! - [`hub`] / [`dispatch`]: `send(identity, message)` and the shared teardown path
//! - [`retry`]: redelivery of unacknowledged messages with a bounded attempt count
//! - [`server`]: axum router (`/ws`, `/push/{identity}`, `/health`, `/metrics`)
//! - [`discovery`]: Consul service registration

#![deny(unsafe_code)]

pub mod admission;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DeliveryConfig, ServerConfig};
pub use connection::{CloseReason, Connection, ConnectionState};
pub use dispatch::{Delivery, SendError};
pub use hub::{DeliveryHub, InboundMessage};
pub use server::{ServerHandle, build_router, start};
