//! Reverse proxy into the sandbox gateway.
//!
//! `ANY /sessions/{id}/proxy/{*path}` forwards to the sandbox's gateway
//! tunnel when the session has one. Bodies stream through unchanged in both
//! directions.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use log::debug;

use super::error::ApiError;
use super::state::AppState;

/// ANY /sessions/{session_id}/proxy/{*path}
pub async fn proxy_sandbox(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(String, String)>,
    mut request: Request,
) -> Result<Response, ApiError> {
    let handle = state
        .registry
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::unknown_session(&session_id))?;

    let snapshot = handle.status().await?;
    let gateway = snapshot
        .tunnels
        .and_then(|t| t.gateway)
        .ok_or_else(|| ApiError::lifecycle("session has no sandbox gateway tunnel"))?;

    let query = request
        .uri()
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let target = format!(
        "{}/{}{}",
        gateway.trim_end_matches('/'),
        path.trim_start_matches('/'),
        query
    );
    let uri: Uri = target
        .parse()
        .map_err(|e| ApiError::gateway(format!("invalid proxy target {}: {}", target, e)))?;

    debug!("session {}: proxying {} {}", session_id, request.method(), uri);

    *request.uri_mut() = uri;
    // The upstream sees its own authority, not ours.
    request.headers_mut().remove(header::HOST);

    let response = state
        .http_client
        .request(request)
        .await
        .map_err(|e| ApiError::gateway(format!("sandbox gateway unreachable: {}", e)))?;

    Ok(response.map(Body::new).into_response())
}

/// Fallback for proxy calls without a subpath.
pub async fn proxy_sandbox_root(
    state: State<AppState>,
    Path(session_id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy_sandbox(state, Path((session_id, String::new())), request).await
}

/// 404 with a JSON body for unmatched routes.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "error": "no such route", "code": "unknown_route" })),
    )
        .into_response()
}
