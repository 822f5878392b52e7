//! # tether
//!
//! Gateway binary: loads settings, installs logging and metrics, opens the
//! audit log, starts the WebSocket server and registers with Consul.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::{DeadLetterSink, PresenceSink, ServiceDirectory};
use tether_server::discovery::{ConsulDirectory, registration_from_settings};
use tether_server::presence::LogPresenceSink;
use tether_server::retry::LogDeadLetters;
use tether_server::{DeliveryHub, ServerConfig};
use tether_settings::TetherSettings;
use tether_telemetry::{SqliteAuditLog, TelemetryConfig, init_telemetry};
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-identity WebSocket gateway with tracked delivery.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Per-identity WebSocket gateway with tracked delivery")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,
}

fn load_settings(cli: &Cli) -> Result<TetherSettings> {
    let mut settings = match &cli.config {
        Some(path) => tether_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => tether_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        settings.telemetry.log_level.clone_from(level);
    }
    Ok(settings)
}

fn audit_sinks(
    settings: &TetherSettings,
) -> Result<(Arc<dyn PresenceSink>, Arc<dyn DeadLetterSink>)> {
    let Some(path) = &settings.telemetry.audit_db_path else {
        return Ok((Arc::new(LogPresenceSink), Arc::new(LogDeadLetters)));
    };
    let path = PathBuf::from(path);
    let audit = SqliteAuditLog::open(&path)
        .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
    info!(path = %path.display(), "audit log opened");
    Ok((Arc::new(audit.clone()), Arc::new(audit)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let telemetry = TelemetryConfig {
        json: settings.telemetry.json,
        ..TelemetryConfig::default()
    }
    .with_level_str(&settings.telemetry.log_level);
    init_telemetry(&telemetry).context("Failed to initialise logging")?;

    let metrics = tether_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let (presence, dead_letters) = audit_sinks(&settings)?;
    let config = ServerConfig::from(&settings);
    let hub = DeliveryHub::with_sinks(config.delivery, presence, dead_letters);

    let server = tether_server::start(config, hub, Some(metrics))
        .await
        .context("Failed to start server")?;

    if settings.discovery.enabled {
        let directory = ConsulDirectory::from_settings(&settings);
        let registration = registration_from_settings(&settings, server.port());
        if let Err(e) = directory.register(&registration).await {
            server.shutdown(Some(SHUTDOWN_TIMEOUT)).await;
            return Err(e).context("Service registration failed");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    server.shutdown(Some(SHUTDOWN_TIMEOUT)).await;
    Ok(())
}
