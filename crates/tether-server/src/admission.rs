//! Binding an upgrade request to an identity.

use serde::Deserialize;
use tether_core::{AdmissionError, Identity};

/// Protocol version assumed when the client sends none.
pub const DEFAULT_VERSION: &str = "1.0.1";
/// Platform assumed when the client sends none.
pub const DEFAULT_PLATFORM: &str = "iOS";

/// Raw query parameters of an upgrade request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AdmissionParams {
    /// Client identity. Required.
    #[serde(default)]
    pub id: Option<String>,
    /// Client protocol version.
    #[serde(default)]
    pub version: Option<String>,
    /// Client platform.
    #[serde(default)]
    pub platform: Option<String>,
}

/// A validated admission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    /// Who is connecting.
    pub identity: Identity,
    /// Protocol version, defaulted.
    pub version: String,
    /// Platform, defaulted.
    pub platform: String,
}

impl AdmissionParams {
    /// Validate and apply defaults. Rejection happens before any upgrade.
    pub fn bind(self) -> Result<Admission, AdmissionError> {
        let identity = Identity::parse(self.id.unwrap_or_default())?;
        Ok(Admission {
            identity,
            version: non_empty_or(self.version, DEFAULT_VERSION),
            platform: non_empty_or(self.platform, DEFAULT_PLATFORM),
        })
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_owned())
}
