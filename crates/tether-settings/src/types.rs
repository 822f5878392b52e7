//! Settings tree.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Delivery and liveness timing.
    pub delivery: DeliverySettings,
    /// Service-directory registration.
    pub discovery: DiscoverySettings,
    /// Logging and audit storage.
    pub telemetry: TelemetrySettings,
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Path of the upgrade endpoint.
    pub ws_path: String,
    /// Address announced to the service directory. Falls back to `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            advertise_address: None,
        }
    }
}

/// Delivery and liveness timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// A connection with no inbound frame for this long is torn down.
    pub idle_timeout_secs: u64,
    /// Delay between redeliveries of an unacknowledged message.
    pub retry_delay_ms: u64,
    /// Total writes of one message before it is dead-lettered.
    pub max_attempts: u32,
    /// Upper bound on a single frame write.
    pub write_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
            retry_delay_ms: 3_000,
            max_attempts: 5,
            write_timeout_ms: 10_000,
        }
    }
}

/// Consul registration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverySettings {
    /// Register at start.
    pub enabled: bool,
    /// `host:port` of the Consul agent.
    pub consul_address: String,
    /// Scheme used to reach the agent (`http` or `https`).
    pub scheme: String,
    /// ACL token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Service instance id. Defaults to `{serviceName}-{port}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Logical service name.
    pub service_name: String,
    /// Service tags.
    pub tags: Vec<String>,
    /// Whether the health check should use `https://`.
    pub tls: bool,
    /// Health check parameters.
    pub check: CheckSettings,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            consul_address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            token: None,
            service_id: None,
            service_name: "tether".to_string(),
            tags: vec!["service".to_string()],
            tls: false,
            check: CheckSettings::default(),
        }
    }
}

/// Health check parameters, in Consul duration syntax.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckSettings {
    /// Path polled by the directory.
    pub uri: String,
    /// Poll interval.
    pub interval: String,
    /// Per-check timeout.
    pub timeout: String,
    /// Deregister after being critical this long.
    pub deregister_after: String,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            uri: "/health".to_string(),
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            deregister_after: "1m".to_string(),
        }
    }
}

/// Logging and audit storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default log level (`RUST_LOG` wins when set).
    pub log_level: String,
    /// Emit JSON log lines.
    pub json: bool,
    /// SQLite file for presence and dead-letter records. Unset logs them instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_db_path: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
            audit_db_path: None,
        }
    }
}
