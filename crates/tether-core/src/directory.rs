//! Service-directory registration contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::DirectoryError;

/// HTTP health check the directory polls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Full URL of the check endpoint.
    pub url: String,
    /// Poll interval, directory syntax (e.g. `10s`).
    pub interval: String,
    /// Per-check timeout.
    pub timeout: String,
    /// Deregister after being critical this long.
    pub deregister_after: String,
}

/// What this process announces at start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// Unique service instance id.
    pub id: String,
    /// Logical service name.
    pub name: String,
    /// Tags.
    pub tags: Vec<String>,
    /// Advertised address.
    pub address: String,
    /// Advertised port.
    pub port: u16,
    /// Health check.
    pub check: HealthCheck,
}

/// Announces this process to a discovery system. Called once at start.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Register (or re-register) the service.
    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DirectoryError>;
}
