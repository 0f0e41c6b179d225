//! Global event bus publisher.
//!
//! Cross-session notifications (session lifecycle, user presence, errors) go
//! to an external bus; delivery is best-effort and never blocks session
//! progress, so failures are logged and dropped.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::Duration;

/// Publisher of session-scoped events to the global bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, session_id: &str, event: &str, payload: Value);
}

/// POSTs events to the configured bus endpoint.
#[derive(Debug, Clone)]
pub struct HttpEventBus {
    client: Client,
    url: String,
}

impl HttpEventBus {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("building event bus HTTP client");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventBus for HttpEventBus {
    async fn publish(&self, session_id: &str, event: &str, payload: Value) {
        let body = json!({
            "sessionId": session_id,
            "event": event,
            "payload": payload,
            "publishedAt": Utc::now().to_rfc3339(),
        });

        if let Err(e) = self.client.post(&self.url).json(&body).send().await {
            warn!("event bus publish failed for {}: {}", event, e);
        }
    }
}

/// Records events in memory; used by tests and `--local` mode.
#[derive(Debug, Default)]
pub struct MemoryEventBus {
    events: Mutex<Vec<(String, String, Value)>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, String, Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_named(&self, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, session_id: &str, event: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((session_id.to_string(), event.to_string(), payload));
    }
}
