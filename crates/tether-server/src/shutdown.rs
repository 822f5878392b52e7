//! Graceful shutdown: stop accepting, close live connections, drain sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::connection::CloseReason;
use crate::hub::DeliveryHub;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the accept-loop token and every socket session spawned by the server.
///
/// Shutdown cancels the token, asks each live connection to close with
/// [`CloseReason::Shutdown`] and waits for the read loops to finish their
/// teardown, so disconnect events and retry cleanup happen before exit.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
    hub: Arc<DeliveryHub>,
}

impl ShutdownCoordinator {
    /// New coordinator for `hub`, not yet triggered.
    pub fn new(hub: Arc<DeliveryHub>) -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
            hub,
        }
    }

    /// Token the listener watches for graceful shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker the upgrade handler wraps each socket session in.
    pub fn sessions(&self) -> TaskTracker {
        self.sessions.clone()
    }

    /// Sessions still running.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Stop the listener, close every connection and wait up to `timeout` for
    /// the sessions and the `server` task.
    pub async fn graceful_shutdown(&self, server: JoinHandle<()>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.token.cancel();
        let closing = self.hub.close_all(CloseReason::Shutdown);
        let _ = self.sessions.close();
        info!(
            closing,
            sessions = self.live_sessions(),
            timeout_secs = timeout.as_secs(),
            "shutting down, draining sessions"
        );

        let drain = async {
            self.sessions.wait().await;
            let _ = server.await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                sessions = self.live_sessions(),
                "shutdown timed out after {timeout:?}, some sessions may still be running"
            );
        }
    }
}
