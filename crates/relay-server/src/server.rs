//! `RelayServer`: the axum HTTP + WebSocket surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::RelayError;
use relay_core::chat::ChatRequest;
use relay_settings::ServerSettings;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auth::{AuthError, Authenticator, Identity};
use crate::health::{self, HealthResponse};
use crate::node::RelayNode;
use crate::session::run_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay node.
    pub node: Arc<RelayNode>,
    /// Bearer token validation.
    pub auth: Arc<dyn Authenticator>,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// The relay HTTP server.
pub struct RelayServer {
    settings: ServerSettings,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl RelayServer {
    /// Create a server for `node`.
    pub fn new(
        settings: ServerSettings,
        node: Arc<RelayNode>,
        auth: Arc<dyn Authenticator>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            settings,
            state: AppState {
                node,
                auth,
                metrics,
                start_time: Instant::now(),
            },
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/messages", post(send_message_handler))
            .route("/online", get(online_handler))
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in the background until shutdown is requested.
    ///
    /// The serving task is tracked by the shutdown coordinator as `"http"`.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, node_id = self.state.node.node_id(), "relay server listening");
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });
        self.shutdown.track("http", server);
        Ok(local_addr)
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The relay node.
    pub fn node(&self) -> &Arc<RelayNode> {
        &self.state.node
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// HTTP status for a relay error at the boundary.
pub fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::InvalidRequest(_) | RelayError::Decode(_) => StatusCode::BAD_REQUEST,
        RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RelayError::ConnectionSaturated { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::BrokerUnavailable { .. } => StatusCode::BAD_GATEWAY,
        RelayError::PersistenceFailure(_)
        | RelayError::UnresponsiveConnection(_)
        | RelayError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &RelayError) -> Response {
    let mut body = json!({ "error": { "code": err.code(), "message": err.to_string() } });
    if let RelayError::BrokerUnavailable {
        message_id: Some(id),
        ..
    } = err
    {
        body["msg_id"] = json!(id);
    }
    (status_for(err), Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn authenticate(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<Identity, RelayError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let token = bearer
        .or(query.token.as_deref())
        .ok_or(AuthError::Missing)?;
    Ok(state.auth.authenticate(token)?)
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let identity = match authenticate(&state, &headers, &query) {
        Ok(identity) => identity,
        Err(e) => {
            info!(error = %e, "websocket upgrade refused");
            return error_response(&e);
        }
    };
    let admission = match state.node.connect(&identity).await {
        Ok(admission) => admission,
        Err(e) => return error_response(&e),
    };

    let node = Arc::clone(&state.node);
    let registry = Arc::clone(node.registry());
    let orphan = Arc::clone(&admission.handle);
    let config = node.session_config().clone();
    ws.max_message_size(config.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(error = %e, user_id = %orphan.user_id(), "websocket upgrade failed");
            let _ = tokio::spawn(async move {
                let _ = registry.evict(&orphan).await;
            });
        })
        .on_upgrade(move |socket| {
            let registry = Arc::clone(node.registry());
            let distributor = Arc::clone(node.distributor());
            run_session(socket, admission, identity, registry, distributor, config)
        })
}

/// POST /messages
async fn send_message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let sender = match authenticate(&state, &headers, &query) {
        Ok(identity) => identity,
        Err(e) => return error_response(&e),
    };
    match state.node.send_chat(&sender, &request).await {
        Ok(id) => (StatusCode::OK, Json(json!({ "msg_id": id }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /online
async fn online_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let users = state.node.registry().online_users().await;
    Json(json!({ "count": users.len(), "users": users }))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "node_id": state.node.node_id(),
        "connections": state.node.registry().count().await,
        "broker": state.node.adapter().metrics_snapshot(),
    }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.node.registry().count().await;
    Json(health::health_check(state.start_time, state.node.node_id(), connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
