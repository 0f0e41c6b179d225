//! Control endpoint handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::directory::GitStatePatch;
use crate::session::{SessionHandle, StartRequest, StatusSnapshot, StopReason};

/// Resolve an existing session or 404.
async fn session(state: &AppState, session_id: &str) -> ApiResult<SessionHandle> {
    state
        .registry
        .get(session_id)
        .await?
        .ok_or_else(|| ApiError::unknown_session(session_id))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "liveSessions": state.registry.live_sessions(),
    }))
}

/// POST /sessions/{session_id}/start
pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<StatusSnapshot>> {
    if request.user_id.is_empty() {
        return Err(ApiError::malformed("userId is required"));
    }
    if request.runner_token.is_empty() {
        return Err(ApiError::malformed("runnerToken is required"));
    }

    let handle = state.registry.ensure(&session_id).await?;
    let snapshot = handle.start(request).await?;
    Ok(Json(snapshot))
}

/// POST /sessions/{session_id}/stop
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let handle = session(&state, &session_id).await?;
    let snapshot = handle.stop(StopReason::UserStopped).await?;
    Ok(Json(snapshot))
}

/// GET /sessions/{session_id}/status
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let handle = session(&state, &session_id).await?;
    let snapshot = handle.status().await?;
    Ok(Json(snapshot))
}

/// POST /sessions/{session_id}/hibernate
pub async fn hibernate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let handle = session(&state, &session_id).await?;
    let snapshot = handle.hibernate().await?;
    Ok(Json(snapshot))
}

/// POST /sessions/{session_id}/wake
pub async fn wake_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let handle = session(&state, &session_id).await?;
    let snapshot = handle.wake().await?;
    Ok(Json(snapshot))
}

/// POST /sessions/{session_id}/clear-queue
pub async fn clear_queue(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let handle = session(&state, &session_id).await?;
    let cleared = handle.clear_queue().await?;
    Ok(Json(json!({ "cleared": cleared })))
}

/// POST /sessions/{session_id}/flush-metrics
pub async fn flush_metrics(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let handle = session(&state, &session_id).await?;
    handle.flush_metrics().await?;
    Ok(Json(json!({ "flushed": true })))
}

/// POST /sessions/{session_id}/gc
pub async fn gc_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.registry.gc(&session_id).await?;
    Ok(Json(json!({ "collected": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub interrupt: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub message_id: String,
}

/// POST /sessions/{session_id}/prompt
pub async fn prompt_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<PromptRequest>,
) -> ApiResult<Json<PromptResponse>> {
    if request.content.is_empty() {
        return Err(ApiError::malformed("content is required"));
    }

    let handle = session(&state, &session_id).await?;
    let message_id = handle
        .prompt(
            request.content,
            request.model,
            request.interrupt,
            request.user_id,
        )
        .await?;
    Ok(Json(PromptResponse { message_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub question_id: String,
    pub answer: String,
}

/// POST /sessions/{session_id}/answer
pub async fn answer_question(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<AnswerRequest>,
) -> ApiResult<Json<Value>> {
    if request.question_id.is_empty() {
        return Err(ApiError::malformed("questionId is required"));
    }

    let handle = session(&state, &session_id).await?;
    let landed = handle.answer(request.question_id, request.answer).await?;
    Ok(Json(json!({ "answered": landed })))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub after: Option<String>,
}

/// GET /sessions/{session_id}/messages?limit&after
pub async fn session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let handle = session(&state, &session_id).await?;

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let after = query
        .after
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| ApiError::malformed(format!("invalid after cursor: {}", e)))
        })
        .transpose()?;

    let messages = handle.messages(limit, after).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUpdateRequest {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_count: Option<i64>,
    #[serde(default)]
    pub pr_state: Option<String>,
    #[serde(default)]
    pub pr_title: Option<String>,
    #[serde(default)]
    pub pr_merged_at: Option<String>,
}

/// POST /sessions/{session_id}/webhook-update
pub async fn webhook_update(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<WebhookUpdateRequest>,
) -> ApiResult<Json<Value>> {
    let handle = session(&state, &session_id).await?;
    handle
        .webhook_update(GitStatePatch {
            branch: request.branch,
            commit_count: request.commit_count,
            pr_state: request.pr_state,
            pr_title: request.pr_title,
            pr_merged_at: request.pr_merged_at,
            ..Default::default()
        })
        .await?;
    Ok(Json(json!({ "ok": true })))
}
