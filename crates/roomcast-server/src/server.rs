//! Axum server setup: shared state, routes, and the listen loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api::{self, error::ApiError};
use crate::auth::{TokenSet, authenticate_upgrade};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::Gateway;
use crate::websocket::connection::Principal;
use crate::websocket::handler::MessageRouter;
use crate::websocket::heartbeat::HeartbeatSupervisor;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::run_ws_session;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live connections and room membership.
    pub registry: Arc<ConnectionRegistry>,
    /// Inbound frame dispatch.
    pub router: MessageRouter,
    /// Broadcast and stats operations.
    pub gateway: Arc<Gateway>,
    /// Accepted bearer tokens.
    pub tokens: TokenSet,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Server start time.
    pub start_time: Instant,
}

/// The roomcast server.
pub struct RoomcastServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    router: MessageRouter,
    gateway: Arc<Gateway>,
    tokens: TokenSet,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RoomcastServer {
    /// Create a new server. Pass the handle from
    /// [`install_recorder`](crate::metrics::install_recorder) to serve `/metrics`.
    pub fn new(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.send_queue_capacity,
        ));
        if config.api_tokens.is_empty() {
            warn!("no API tokens configured, management API will reject every request");
        }
        Self {
            router: MessageRouter::new(registry.clone()),
            gateway: Arc::new(Gateway::new(registry.clone())),
            tokens: TokenSet::new(config.api_tokens.iter().cloned()),
            config: Arc::new(config),
            registry,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            router: self.router.clone(),
            gateway: self.gateway.clone(),
            tokens: self.tokens.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .nest("/api/v1/websocket", api::routes(self.tokens.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind, start the heartbeat supervisor, and serve until shutdown.
    ///
    /// Returns the bound address and a handle that completes once the HTTP
    /// server and the supervisor have both stopped.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        let supervisor = HeartbeatSupervisor::new(
            self.registry.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        );

        info!(
            %addr,
            max_connections = self.config.max_connections,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            "roomcast server listening"
        );

        let handle = tokio::spawn(async move {
            let heartbeat = supervisor.spawn(token.clone());
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(token.clone().cancelled_owned());
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
            token.cancel();
            let _ = heartbeat.await;
            info!("server stopped");
        });
        Ok((addr, handle))
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The broadcast/stats gateway.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.len(),
        state.registry.rooms().room_count(),
        state.shutdown.is_shutting_down(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => ApiError::ServiceUnavailable("metrics recorder not installed".into()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return ApiError::ServiceUnavailable("server is shutting down".into()).into_response();
    }

    let principal = match authenticate_upgrade(
        &state.tokens,
        &headers,
        query.token.as_deref(),
        state.config.require_ws_auth,
    ) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "websocket upgrade refused");
            return ApiError::Unauthorized(e).into_response();
        }
    };

    if state.registry.is_full() {
        warn!(limit = state.registry.max_connections(), "websocket upgrade refused, at capacity");
        return ApiError::ServiceUnavailable("connection limit reached".into()).into_response();
    }

    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, principal))
}

/// Admit the upgraded socket and run its session.
async fn handle_socket(mut socket: WebSocket, state: AppState, principal: Principal) {
    // Capacity may have filled between the check and the upgrade.
    let admission = match state.registry.admit(principal) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "admission failed after upgrade");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    run_ws_session(
        socket,
        admission,
        state.router.clone(),
        state.registry.clone(),
        state.config.write_timeout(),
        state.shutdown.token(),
    )
    .await;
}
