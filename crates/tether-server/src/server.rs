//! HTTP surface: upgrade endpoint, push, health and metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::ExtensionRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::{Message, TransportError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionParams;
use crate::config::ServerConfig;
use crate::dispatch::{Delivery, SendError};
use crate::health::{self, HealthResponse};
use crate::hub::DeliveryHub;
use crate::metrics::ADMISSION_REJECTED_TOTAL;
use crate::session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connections and pending deliveries.
    pub hub: Arc<DeliveryHub>,
    /// Process start, for uptime.
    pub start_time: Instant,
    /// Prometheus renderer, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Socket sessions, drained on shutdown.
    pub sessions: TaskTracker,
}

/// Build the router. `ws_path` is where clients upgrade.
pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/push/{identity}", post(push_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn ws_handler(
    Query(params): Query<AdmissionParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    connect_info: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    State(state): State<AppState>,
) -> Response {
    let admission = match params.bind() {
        Ok(admission) => admission,
        Err(e) => {
            counter!(ADMISSION_REJECTED_TOTAL).increment(1);
            debug!(error = %e, "rejecting upgrade");
            return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(identity = %admission.identity, error = %rejection, "not a websocket upgrade");
            return rejection.into_response();
        }
    };
    let remote_address = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|_| "unknown".into());

    let identity = admission.identity.clone();
    let hub = Arc::clone(&state.hub);
    let sessions = state.sessions.clone();
    ws.on_failed_upgrade(move |e: axum::Error| {
        let err = TransportError::Upgrade(e.to_string());
        warn!(%identity, error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| {
        sessions.track_future(session::serve_socket(hub, socket, admission, remote_address))
    })
}

async fn push_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(message): Json<Message>,
) -> Result<(StatusCode, Json<Delivery>), SendError> {
    let delivery = state.hub.send(&identity, message).await?;
    Ok((StatusCode::ACCEPTED, Json(delivery)))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.connection_count(),
        state.hub.pending_count(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: Arc<DeliveryHub>,
    shutdown: ShutdownCoordinator,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The hub serving this listener.
    pub fn hub(&self) -> &Arc<DeliveryHub> {
        &self.hub
    }

    /// Stop accepting, close every connection and wait for the sessions and
    /// the listener task.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        self.shutdown.graceful_shutdown(self.server, timeout).await;
    }
}

/// Bind and serve until [`ServerHandle::shutdown`].
pub async fn start(
    config: ServerConfig,
    hub: Arc<DeliveryHub>,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = ShutdownCoordinator::new(Arc::clone(&hub));
    let state = AppState {
        hub: Arc::clone(&hub),
        start_time: Instant::now(),
        metrics,
        sessions: shutdown.sessions(),
    };
    let router = build_router(state, &config.ws_path);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, ws_path = %config.ws_path, "tether server started");

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
        if let Err(e) = result {
            error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        hub,
        shutdown,
        server,
    })
}
