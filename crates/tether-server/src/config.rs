//! Runtime configuration for the gateway and the delivery engine.

use std::time::Duration;

use tether_settings::TetherSettings;

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Path of the upgrade endpoint.
    pub ws_path: String,
    /// Delivery timing.
    pub delivery: DeliveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/ws".into(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl From<&TetherSettings> for ServerConfig {
    fn from(settings: &TetherSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            ws_path: settings.server.ws_path.clone(),
            delivery: DeliveryConfig::from(settings),
        }
    }
}

/// Liveness and retry timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Sliding deadline: no inbound frame for this long tears the connection down.
    pub idle_timeout: Duration,
    /// Fixed delay between redeliveries.
    pub retry_delay: Duration,
    /// Total writes of one message before dead-lettering.
    pub max_attempts: u32,
    /// Upper bound on one frame write.
    pub write_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            retry_delay: Duration::from_secs(3),
            max_attempts: 5,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&TetherSettings> for DeliveryConfig {
    fn from(settings: &TetherSettings) -> Self {
        let d = &settings.delivery;
        Self {
            idle_timeout: Duration::from_secs(d.idle_timeout_secs),
            retry_delay: Duration::from_millis(d.retry_delay_ms),
            max_attempts: d.max_attempts.max(1),
            write_timeout: Duration::from_millis(d.write_timeout_ms),
        }
    }
}
