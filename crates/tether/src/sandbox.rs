//! Sandbox provisioner client.
//!
//! The provisioner owns the actual virtual machines; the session only drives
//! it over HTTP with the per-session endpoint URLs stored at start. A 409 on
//! snapshot means the sandbox already exited, which callers treat as a clean
//! termination rather than an error.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::session::models::{SpawnRequest, TunnelUrls};

/// Result of spawning or restoring a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    #[serde(default)]
    pub tunnels: TunnelUrls,
}

/// Outcome of a snapshot call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot taken; the sandbox is terminated as part of it.
    Snapshot(String),
    /// The sandbox already exited (HTTP 409); nothing to snapshot.
    Gone,
}

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("provisioner unreachable at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("provisioner returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse provisioner response: {0}")]
    Parse(String),
}

pub type ProvisionerResult<T> = Result<T, ProvisionerError>;

impl From<reqwest::Error> for ProvisionerError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        Self::ConnectionFailed {
            url,
            message: err.to_string(),
        }
    }
}

/// Driver for sandbox lifecycle calls.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn spawn(&self, url: &str, request: &SpawnRequest) -> ProvisionerResult<SandboxInfo>;

    async fn snapshot(&self, url: &str, sandbox_id: &str) -> ProvisionerResult<SnapshotOutcome>;

    async fn restore(
        &self,
        url: &str,
        snapshot_id: &str,
        request: &SpawnRequest,
    ) -> ProvisionerResult<SandboxInfo>;

    async fn terminate(&self, url: &str, sandbox_id: &str) -> ProvisionerResult<()>;
}

/// HTTP implementation against the real provisioner.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: Client,
}

impl HttpProvisioner {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("building provisioner HTTP client");
        Self { client }
    }

    async fn read_error(response: reqwest::Response) -> ProvisionerError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        ProvisionerError::Api { status, message }
    }
}

impl Default for HttpProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn spawn(&self, url: &str, request: &SpawnRequest) -> ProvisionerResult<SandboxInfo> {
        let response = self.client.post(url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProvisionerError::Parse(e.to_string()))
    }

    async fn snapshot(&self, url: &str, sandbox_id: &str) -> ProvisionerResult<SnapshotOutcome> {
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "sandboxId": sandbox_id }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(SnapshotOutcome::Gone);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SnapshotResponse {
            snapshot_id: String,
        }

        let body: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| ProvisionerError::Parse(e.to_string()))?;
        Ok(SnapshotOutcome::Snapshot(body.snapshot_id))
    }

    async fn restore(
        &self,
        url: &str,
        snapshot_id: &str,
        request: &SpawnRequest,
    ) -> ProvisionerResult<SandboxInfo> {
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "snapshotId": snapshot_id,
                "spawnRequest": request,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProvisionerError::Parse(e.to_string()))
    }

    async fn terminate(&self, url: &str, sandbox_id: &str) -> ProvisionerResult<()> {
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "sandboxId": sandbox_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }
}

/// In-memory provisioner for tests and `--local` mode. Hands out sequential
/// sandbox and snapshot ids and records every call.
#[derive(Debug, Default)]
pub struct StaticProvisioner {
    counter: AtomicU64,
    /// When set, the next snapshot call reports the sandbox gone (409).
    pub gone_on_snapshot: std::sync::atomic::AtomicBool,
    calls: Mutex<Vec<String>>,
    spawn_requests: Mutex<Vec<SpawnRequest>>,
}

impl StaticProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Spawn requests seen so far, in order.
    pub async fn spawn_requests(&self) -> Vec<SpawnRequest> {
        self.spawn_requests.lock().await.clone()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn spawn(&self, _url: &str, request: &SpawnRequest) -> ProvisionerResult<SandboxInfo> {
        let id = self.next_id("sandbox");
        self.record(format!("spawn:{}", id)).await;
        self.spawn_requests.lock().await.push(request.clone());
        Ok(SandboxInfo {
            sandbox_id: id,
            tunnels: TunnelUrls::default(),
        })
    }

    async fn snapshot(&self, _url: &str, sandbox_id: &str) -> ProvisionerResult<SnapshotOutcome> {
        self.record(format!("snapshot:{}", sandbox_id)).await;
        if self.gone_on_snapshot.load(Ordering::SeqCst) {
            return Ok(SnapshotOutcome::Gone);
        }
        Ok(SnapshotOutcome::Snapshot(self.next_id("snap")))
    }

    async fn restore(
        &self,
        _url: &str,
        snapshot_id: &str,
        _request: &SpawnRequest,
    ) -> ProvisionerResult<SandboxInfo> {
        self.record(format!("restore:{}", snapshot_id)).await;
        Ok(SandboxInfo {
            sandbox_id: self.next_id("sandbox"),
            tunnels: TunnelUrls::default(),
        })
    }

    async fn terminate(&self, _url: &str, sandbox_id: &str) -> ProvisionerResult<()> {
        self.record(format!("terminate:{}", sandbox_id)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provisioner_ids() {
        let p = StaticProvisioner::new();
        let req = SpawnRequest::default();

        let a = p.spawn("http://x", &req).await.unwrap();
        let snap = p.snapshot("http://x", &a.sandbox_id).await.unwrap();
        assert!(matches!(snap, SnapshotOutcome::Snapshot(_)));

        p.gone_on_snapshot.store(true, Ordering::SeqCst);
        let gone = p.snapshot("http://x", &a.sandbox_id).await.unwrap();
        assert_eq!(gone, SnapshotOutcome::Gone);

        let calls = p.calls().await;
        assert_eq!(calls[0], "spawn:sandbox-1");
        assert!(calls[1].starts_with("snapshot:"));
    }
}
