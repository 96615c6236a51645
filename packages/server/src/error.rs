//! Server error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use outpost_protocol::{CorrelationError, MessageType, ProtocolError};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure routing a request to an agent.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("agent `{0}` is not connected")]
    AgentNotFound(String),

    #[error("agent `{0}` disconnected")]
    Disconnected(String),

    /// No reply within the caller's deadline. The remote operation may
    /// still be running.
    #[error("no reply from agent `{agent_id}` within {timeout:?}")]
    Timeout { agent_id: String, timeout: Duration },

    /// The agent answered with an error reply.
    #[error("agent error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("expected `{expected}` reply, got `{actual}`")]
    UnexpectedResponse {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("request id `{0}` is already in flight")]
    DuplicateRequest(String),

    #[error("`{0}` is not a request type")]
    NotRequest(MessageType),

    #[error("hub is shutting down")]
    Shutdown,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HubError {
    pub(crate) fn from_correlation(
        error: CorrelationError,
        agent_id: &str,
        timeout: Duration,
    ) -> Self {
        match error {
            CorrelationError::Disconnected => HubError::Disconnected(agent_id.to_string()),
            CorrelationError::Timeout => HubError::Timeout {
                agent_id: agent_id.to_string(),
                timeout,
            },
            CorrelationError::DuplicateId(id) => HubError::DuplicateRequest(id),
        }
    }
}

/// Error returned by the relay API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED".to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST".to_string()),
            ApiError::Hub(hub) => match hub {
                HubError::AgentNotFound(_) => (StatusCode::NOT_FOUND, "AGENT_NOT_FOUND".to_string()),
                HubError::Disconnected(_) => {
                    (StatusCode::BAD_GATEWAY, "AGENT_DISCONNECTED".to_string())
                }
                HubError::Timeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "AGENT_TIMEOUT".to_string())
                }
                HubError::Remote { code, .. } => (StatusCode::UNPROCESSABLE_ENTITY, code.clone()),
                HubError::UnexpectedResponse { .. } | HubError::Protocol(_) => {
                    (StatusCode::BAD_GATEWAY, "PROTOCOL_ERROR".to_string())
                }
                HubError::DuplicateRequest(_) => (StatusCode::CONFLICT, "DUPLICATE_REQUEST".to_string()),
                HubError::NotRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST".to_string()),
                HubError::Shutdown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN".to_string())
                }
            },
        };

        let body = Json(json!({
            "code": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
