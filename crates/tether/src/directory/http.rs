//! HTTP client for the directory service.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

use super::types::*;
use super::{Directory, DirectoryError, DirectoryResult};

/// REST client against the directory service.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building directory HTTP client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn handle<T: DeserializeOwned>(response: reqwest::Response) -> DirectoryResult<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| DirectoryError::Parse(e.to_string()))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(DirectoryError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn check(response: reqwest::Response) -> DirectoryResult<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(DirectoryError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn post(&self, path: &str, body: &Value) -> DirectoryResult<()> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| DirectoryError::ConnectionFailed(e.to_string()))?;
        Self::check(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> DirectoryResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| DirectoryError::ConnectionFailed(e.to_string()))?;
        Self::handle(response).await
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> DirectoryResult<Option<T>> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| DirectoryError::ConnectionFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle(response).await.map(Some)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn upsert_session(&self, row: DirectorySession) -> DirectoryResult<()> {
        self.post("/sessions", &serde_json::to_value(row).unwrap())
            .await
    }

    async fn get_session(&self, id: &str) -> DirectoryResult<Option<DirectorySession>> {
        self.get_optional(&format!("/sessions/{}", id)).await
    }

    async fn update_session_status(&self, id: &str, status: &str) -> DirectoryResult<()> {
        self.post(
            &format!("/sessions/{}/status", id),
            &json!({ "status": status }),
        )
        .await
    }

    async fn set_session_title(&self, id: &str, title: &str) -> DirectoryResult<()> {
        self.post(
            &format!("/sessions/{}/title", id),
            &json!({ "title": title }),
        )
        .await
    }

    async fn add_active_seconds(&self, id: &str, seconds: i64) -> DirectoryResult<()> {
        self.post(
            &format!("/sessions/{}/active-seconds", id),
            &json!({ "seconds": seconds }),
        )
        .await
    }

    async fn children_of(&self, id: &str) -> DirectoryResult<Vec<DirectorySession>> {
        self.get_json(&format!("/sessions/{}/children", id)).await
    }

    async fn get_git_state(&self, session_id: &str) -> DirectoryResult<Option<GitState>> {
        self.get_optional(&format!("/sessions/{}/git-state", session_id))
            .await
    }

    async fn update_git_state(
        &self,
        session_id: &str,
        patch: GitStatePatch,
    ) -> DirectoryResult<()> {
        self.post(
            &format!("/sessions/{}/git-state", session_id),
            &serde_json::to_value(patch).unwrap(),
        )
        .await
    }

    async fn upsert_file_change(
        &self,
        session_id: &str,
        path: &str,
        status: &str,
        additions: i64,
        deletions: i64,
    ) -> DirectoryResult<()> {
        self.post(
            &format!("/sessions/{}/file-changes", session_id),
            &json!({
                "path": path,
                "status": status,
                "additions": additions,
                "deletions": deletions,
            }),
        )
        .await
    }

    async fn user_profile(&self, user_id: &str) -> DirectoryResult<Option<UserProfile>> {
        self.get_optional(&format!("/users/{}", user_id)).await
    }

    async fn oauth_token(&self, user_id: &str, provider: &str) -> DirectoryResult<Option<String>> {
        #[derive(serde::Deserialize)]
        struct TokenRow {
            token: String,
        }
        let row: Option<TokenRow> = self
            .get_optional(&format!("/users/{}/oauth-tokens/{}", user_id, provider))
            .await?;
        Ok(row.map(|r| r.token))
    }

    async fn model_preferences(&self, user_id: &str) -> DirectoryResult<Vec<String>> {
        self.get_json(&format!("/users/{}/model-preferences", user_id))
            .await
    }

    async fn save_model_catalogue(&self, user_id: &str, models: Value) -> DirectoryResult<()> {
        self.post(
            &format!("/users/{}/model-catalogue", user_id),
            &json!({ "models": models }),
        )
        .await
    }

    async fn memory_read(
        &self,
        user_id: &str,
        query: Option<&str>,
        limit: u32,
    ) -> DirectoryResult<Vec<MemoryRow>> {
        let mut path = format!("/users/{}/memory?limit={}", user_id, limit);
        if let Some(q) = query {
            path.push_str("&query=");
            path.push_str(&urlencode(q));
        }
        self.get_json(&path).await
    }

    async fn memory_write(
        &self,
        user_id: &str,
        content: &str,
        tags: &[String],
    ) -> DirectoryResult<MemoryRow> {
        let response = self
            .client
            .post(self.url(&format!("/users/{}/memory", user_id)))
            .json(&json!({ "content": content, "tags": tags }))
            .send()
            .await
            .map_err(|e| DirectoryError::ConnectionFailed(e.to_string()))?;
        Self::handle(response).await
    }

    async fn memory_delete(&self, user_id: &str, id: &str) -> DirectoryResult<bool> {
        let response = self
            .client
            .delete(self.url(&format!("/users/{}/memory/{}", user_id, id)))
            .send()
            .await
            .map_err(|e| DirectoryError::ConnectionFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await.map(|_| true)
    }

    async fn boost_memory(&self, user_id: &str, id: &str) -> DirectoryResult<()> {
        self.post(&format!("/users/{}/memory/{}/boost", user_id, id), &json!({}))
            .await
    }

    async fn org_repos(&self) -> DirectoryResult<Vec<OrgRepo>> {
        self.get_json("/org/repositories").await
    }

    async fn personas(&self) -> DirectoryResult<Vec<Persona>> {
        self.get_json("/personas").await
    }

    async fn append_audit(
        &self,
        session_id: &str,
        entries: &[AuditSinkEntry],
    ) -> DirectoryResult<()> {
        self.post(
            &format!("/sessions/{}/audit-log", session_id),
            &json!({ "entries": entries }),
        )
        .await
    }
}

/// Minimal percent-encoding for query values.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("plain-query_1.2~x"), "plain-query_1.2~x");
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
    }

    #[test]
    fn test_url_join() {
        let dir = HttpDirectory::new("http://directory:9000/");
        assert_eq!(dir.url("/sessions/x"), "http://directory:9000/sessions/x");
    }
}
