//! API route definitions.

use axum::{
    Router,
    routing::{any, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::proxy;
use super::state::AppState;
use super::ws;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let session_routes = Router::new()
        .route("/start", post(handlers::start_session))
        .route("/stop", post(handlers::stop_session))
        .route("/status", get(handlers::session_status))
        .route("/hibernate", post(handlers::hibernate_session))
        .route("/wake", post(handlers::wake_session))
        .route("/clear-queue", post(handlers::clear_queue))
        .route("/flush-metrics", post(handlers::flush_metrics))
        .route("/gc", post(handlers::gc_session))
        .route("/prompt", post(handlers::prompt_session))
        .route("/answer", post(handlers::answer_question))
        .route("/messages", get(handlers::session_messages))
        .route("/webhook-update", post(handlers::webhook_update))
        .route("/ws", get(ws::ws_handler))
        .route("/proxy", any(proxy::proxy_sandbox_root))
        .route("/proxy/{*path}", any(proxy::proxy_sandbox));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/sessions/{session_id}", session_routes)
        .fallback(proxy::not_found)
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
