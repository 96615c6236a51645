//! HTTP surface
//!
//! The agent WebSocket endpoint plus a small JSON relay API for operators:
//! list agents, run a command, or send any typed request and get the typed
//! reply back.

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use outpost_protocol::payloads::{CommandRequest, CommandResult};
use outpost_protocol::{MessageType, Payload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::Authenticator;
use crate::connection::serve_connection;
use crate::error::{ApiError, HubError};
use crate::hub::{AgentInfo, Hub};
use crate::transport::AxumTransport;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub auth: Arc<Authenticator>,
    /// Whether the relay API requires the API key
    pub require_api_key: bool,
}

/// Body of `POST /api/agents/:id/request`.
#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    /// Seconds to wait for the reply; the hub default when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RelayResponse {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Value,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route("/agents/:id/exec", post(exec))
        .route("/agents/:id/request", post(relay))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/healthz", get(health))
        .route("/ws/agent", get(agent_socket))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.require_api_key {
        return Ok(next.run(request).await);
    }

    let headers = request.headers();
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("ApiKey ")))
        .or_else(|| headers.get("x-api-key").and_then(|h| h.to_str().ok()));

    match presented {
        Some(key) if state.auth.check_api_key(key.trim()) => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "agents": state.hub.agents().await.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn agent_socket(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    debug!(peer = ?peer, "Agent WebSocket upgrade");
    ws.on_upgrade(move |socket| {
        serve_connection(state.hub, state.auth, AxumTransport::new(socket, peer))
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    let agents = state.hub.agents().await;
    Json(agents.iter().map(|agent| agent.info()).collect())
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentInfo>, ApiError> {
    let agent = state
        .hub
        .get(&agent_id)
        .await
        .ok_or(HubError::AgentNotFound(agent_id))?;
    Ok(Json(agent.info()))
}

async fn exec(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandResult>, ApiError> {
    if request.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command is empty".to_string()));
    }
    let result = state.hub.execute_command(&agent_id, request).await?;
    Ok(Json(result))
}

async fn relay(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<RelayRequest>,
) -> Result<Json<RelayResponse>, ApiError> {
    if matches!(request.kind, MessageType::Auth | MessageType::Ping) || !request.kind.is_request() {
        return Err(ApiError::BadRequest(format!(
            "`{}` cannot be relayed",
            request.kind
        )));
    }

    let payload = Payload::decode(request.kind, request.data)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let timeout = request.timeout_secs.map(Duration::from_secs);

    let reply = state.hub.request(&agent_id, payload, timeout).await?;
    Ok(Json(RelayResponse {
        kind: reply.kind(),
        data: reply.to_data().map_err(HubError::from)?,
    }))
}
