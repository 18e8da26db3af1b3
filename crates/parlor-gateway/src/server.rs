//! `ParlorServer`: Axum HTTP + `WebSocket` listener in front of a [`Gateway`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parlor_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::gateway::Gateway;
use crate::health::HealthResponse;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The gateway every session attaches to.
    pub gateway: Arc<Gateway>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Largest accepted `WebSocket` message, in bytes.
    pub max_message_size: usize,
}

/// The parlor server.
pub struct ParlorServer {
    settings: ServerSettings,
    gateway: Arc<Gateway>,
    metrics: Option<PrometheusHandle>,
}

impl ParlorServer {
    /// Create a new server around `gateway`.
    pub fn new(settings: ServerSettings, gateway: Arc<Gateway>) -> Self {
        Self {
            settings,
            gateway,
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: self.gateway.clone(),
            metrics: self.metrics.clone(),
            max_message_size: self.settings.max_message_size,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/metrics", get(metrics_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listener, start the gateway and serve until the gateway's
    /// shutdown token is cancelled.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
        let listener =
            TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;
        self.gateway.start();
        info!(%addr, "parlor listening");

        let app = self.router();
        let token = self.gateway.shutdown().token();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled_owned().await })
                .await
        });
        Ok((addr, handle))
    }

    /// Get the gateway.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Get the server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.gateway.health_report())
}

/// GET /ws: upgrade and hand the socket to a session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.gateway.shutdown().is_shutting_down() {
        warn!("rejecting upgrade during shutdown");
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let gateway = state.gateway;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, gateway))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
