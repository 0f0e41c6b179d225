//! Error responses for the control and socket surface.
//!
//! The variants map one-to-one onto the failure classes a session broker
//! actually has: addressing a session, malformed control input, runner
//! authentication, lifecycle conflicts, a dead agent loop, and the sandbox
//! gateway. Each serializes as `{ "error": ..., "code": ... }`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::session::AgentError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// No session with this id: never started, or garbage-collected.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The control request itself is unusable (missing field, bad cursor,
    /// invalid session id, unknown socket role).
    #[error("{0}")]
    Malformed(String),

    /// The runner presented a wrong shared secret.
    #[error("runner authentication failed")]
    RunnerAuth,

    /// The operation is not legal in the session's current lifecycle state
    /// (e.g. waking a running session, prompting a terminated one).
    #[error("{0}")]
    Lifecycle(String),

    /// The session's worker loop is gone; retry after the session reloads.
    #[error("session agent unavailable")]
    AgentGone,

    /// The sandbox gateway tunnel could not be reached.
    #[error("sandbox gateway error: {0}")]
    Gateway(String),

    /// Store or collaborator failure inside the session agent.
    #[error("session error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn unknown_session(session_id: impl Into<String>) -> Self {
        Self::UnknownSession(session_id.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::RunnerAuth => StatusCode::UNAUTHORIZED,
            Self::Lifecycle(_) => StatusCode::CONFLICT,
            Self::AgentGone => StatusCode::SERVICE_UNAVAILABLE,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) => "unknown_session",
            Self::Malformed(_) => "malformed_request",
            Self::RunnerAuth => "runner_auth_failed",
            Self::Lifecycle(_) => "lifecycle_conflict",
            Self::AgentGone => "agent_unavailable",
            Self::Gateway(_) => "sandbox_gateway",
            Self::Internal(_) => "internal",
        }
    }
}

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();

        // Server-side failures are our problem; everything else is the
        // caller's and stays at debug.
        if status.is_server_error() {
            error!(code, message = %message, "session request failed");
        } else {
            tracing::debug!(code, message = %message, "session request rejected");
        }

        let body = ErrorBody {
            error: message,
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NotStarted => Self::UnknownSession("session not started".to_string()),
            AgentError::InvalidToken => Self::RunnerAuth,
            AgentError::BadRequest(msg) => Self::Malformed(msg),
            AgentError::Conflict(msg) => Self::Lifecycle(msg),
            AgentError::Internal(msg) => Self::Internal(msg),
            AgentError::Closed => Self::AgentGone,
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
