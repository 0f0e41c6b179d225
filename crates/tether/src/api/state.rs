//! Application state shared across handlers.

use std::sync::Arc;

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::session::SessionRegistry;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Registry of live session agents.
    pub registry: Arc<SessionRegistry>,
    /// HTTP client for proxying requests into sandboxes.
    pub http_client: Client<HttpConnector, Body>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let http_client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build_http();
        Self {
            registry,
            http_client,
        }
    }
}
