//! Git-provider bridge.
//!
//! Handles PR creation, updates, listing, and inspection against the
//! provider's REST API. Tokens are resolved by the caller (prompt author
//! first, session owner second) and passed in per call. Collection fetches
//! page until the caller's limit, hard-capped at 300 per collection with an
//! explicit truncation flag.

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use tether_protocol::runner::PrInfo;

/// Hard cap for any single paged collection.
pub const COLLECTION_CAP: u32 = 300;

const PER_PAGE: u32 = 100;

static HTTPS_REMOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^/]+/([^/]+)/([^/]+?)(?:\.git)?/?$").unwrap());
static SSH_REMOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^git@[^:]+:([^/]+)/([^/]+?)(?:\.git)?$").unwrap());

/// Extract `(owner, repo)` from an https or ssh remote URL.
pub fn parse_repo_url(url: &str) -> Option<(String, String)> {
    let caps = HTTPS_REMOTE
        .captures(url)
        .or_else(|| SSH_REMOTE.captures(url))?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// REST client for the git provider.
#[derive(Debug, Clone)]
pub struct GitProviderClient {
    client: Client,
    api_base: String,
}

impl GitProviderClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("tether-session-broker")
            .build()
            .expect("building git provider HTTP client");
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }

    async fn get(&self, token: &str, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("calling git provider")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("git provider returned {}: {}", status, body));
        }
        response.json().await.context("parsing provider response")
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        token: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value> {
        let response = self
            .client
            .request(method, self.url(path))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(body)
            .send()
            .await
            .context("calling git provider")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("git provider returned {}: {}", status, text));
        }
        response.json().await.context("parsing provider response")
    }

    /// Fetch pages of a collection until `limit` items, capped at
    /// [`COLLECTION_CAP`]. Returns the items and whether they were truncated.
    async fn paged(
        &self,
        token: &str,
        path: &str,
        limit: u32,
    ) -> Result<(Vec<Value>, bool)> {
        let effective = limit.min(COLLECTION_CAP);
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let sep = if path.contains('?') { '&' } else { '?' };
            let body = self
                .get(
                    token,
                    &format!("{}{}per_page={}&page={}", path, sep, PER_PAGE, page),
                )
                .await?;
            let batch = body
                .as_array()
                .cloned()
                .ok_or_else(|| anyhow!("expected array from provider at {}", path))?;
            let batch_len = batch.len();
            items.extend(batch);

            if items.len() as u32 >= effective {
                let truncated = items.len() as u32 > effective || batch_len as u32 == PER_PAGE;
                items.truncate(effective as usize);
                return Ok((items, truncated));
            }
            if (batch_len as u32) < PER_PAGE {
                return Ok((items, false));
            }
            page += 1;
        }
    }

    /// Default branch of a repository, falling back to `main` when the call
    /// fails.
    pub async fn default_branch(&self, token: &str, owner: &str, repo: &str) -> String {
        match self.get(token, &format!("/repos/{}/{}", owner, repo)).await {
            Ok(body) => body["default_branch"]
                .as_str()
                .unwrap_or("main")
                .to_string(),
            Err(e) => {
                log::warn!("default-branch lookup failed for {}/{}: {}", owner, repo, e);
                "main".to_string()
            }
        }
    }

    pub async fn create_pr(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        title: &str,
        body: Option<&str>,
        head: &str,
        base: &str,
        draft: bool,
    ) -> Result<PrInfo> {
        let response = self
            .send_json(
                reqwest::Method::POST,
                token,
                &format!("/repos/{}/{}/pulls", owner, repo),
                &json!({
                    "title": title,
                    "body": body,
                    "head": head,
                    "base": base,
                    "draft": draft,
                }),
            )
            .await?;

        pr_info_from(&response)
    }

    pub async fn update_pr(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        number: i64,
        title: Option<&str>,
        body: Option<&str>,
        state: Option<&str>,
    ) -> Result<PrInfo> {
        let mut patch = serde_json::Map::new();
        if let Some(title) = title {
            patch.insert("title".to_string(), json!(title));
        }
        if let Some(body) = body {
            patch.insert("body".to_string(), json!(body));
        }
        if let Some(state) = state {
            patch.insert("state".to_string(), json!(state));
        }

        let response = self
            .send_json(
                reqwest::Method::PATCH,
                token,
                &format!("/repos/{}/{}/pulls/{}", owner, repo, number),
                &Value::Object(patch),
            )
            .await?;

        pr_info_from(&response)
    }

    pub async fn list_pull_requests(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        state: Option<&str>,
        limit: u32,
    ) -> Result<Value> {
        let state = state.unwrap_or("open");
        let (items, truncated) = self
            .paged(
                token,
                &format!("/repos/{}/{}/pulls?state={}", owner, repo, state),
                limit,
            )
            .await?;

        Ok(json!({ "pullRequests": items, "truncated": truncated }))
    }

    /// Compose a full PR view: the PR itself, changed files, reviews, review
    /// comments (minus those on dismissed reviews), combined status, and
    /// check runs.
    pub async fn inspect_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        number: i64,
        limit: u32,
    ) -> Result<Value> {
        let base = format!("/repos/{}/{}/pulls/{}", owner, repo, number);
        let pr = self.get(token, &base).await?;

        let (files, files_truncated) = self.paged(token, &format!("{}/files", base), limit).await?;
        let (reviews, reviews_truncated) =
            self.paged(token, &format!("{}/reviews", base), limit).await?;
        let (comments, comments_truncated) =
            self.paged(token, &format!("{}/comments", base), limit).await?;

        // Comments attached to a dismissed review carry stale feedback.
        let dismissed: Vec<i64> = reviews
            .iter()
            .filter(|r| r["state"].as_str() == Some("DISMISSED"))
            .filter_map(|r| r["id"].as_i64())
            .collect();
        let comments: Vec<Value> = comments
            .into_iter()
            .filter(|c| {
                c["pull_request_review_id"]
                    .as_i64()
                    .map(|id| !dismissed.contains(&id))
                    .unwrap_or(true)
            })
            .collect();

        let head_sha = pr["head"]["sha"].as_str().unwrap_or_default().to_string();
        let combined_status = self
            .get(
                token,
                &format!("/repos/{}/{}/commits/{}/status", owner, repo, head_sha),
            )
            .await
            .unwrap_or(Value::Null);
        let check_runs = self
            .get(
                token,
                &format!("/repos/{}/{}/commits/{}/check-runs", owner, repo, head_sha),
            )
            .await
            .unwrap_or(Value::Null);

        Ok(json!({
            "pullRequest": pr,
            "files": files,
            "reviews": reviews,
            "comments": comments,
            "combinedStatus": combined_status,
            "checkRuns": check_runs,
            "truncated": files_truncated || reviews_truncated || comments_truncated,
        }))
    }

    /// Repositories visible to the token's user.
    pub async fn list_repos(&self, token: &str, limit: u32) -> Result<Value> {
        let (items, truncated) = self
            .paged(token, "/user/repos?sort=updated", limit)
            .await?;
        Ok(json!({ "repositories": items, "truncated": truncated }))
    }
}

impl Default for GitProviderClient {
    fn default() -> Self {
        Self::new("https://api.github.com")
    }
}

fn pr_info_from(body: &Value) -> Result<PrInfo> {
    Ok(PrInfo {
        number: body["number"]
            .as_i64()
            .ok_or_else(|| anyhow!("provider response missing PR number"))?,
        title: body["title"].as_str().unwrap_or_default().to_string(),
        url: body["html_url"].as_str().unwrap_or_default().to_string(),
        state: body["state"].as_str().map(|s| s.to_string()),
        created_at: body["created_at"].as_str().map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_https_remote() {
        assert_eq!(
            parse_repo_url("https://github.com/acme/app"),
            Some(("acme".to_string(), "app".to_string()))
        );
        assert_eq!(
            parse_repo_url("https://github.com/acme/app.git"),
            Some(("acme".to_string(), "app".to_string()))
        );
        assert_eq!(
            parse_repo_url("https://git.example.io/team/tool/"),
            Some(("team".to_string(), "tool".to_string()))
        );
    }

    #[test]
    fn test_parse_ssh_remote() {
        assert_eq!(
            parse_repo_url("git@github.com:acme/app.git"),
            Some(("acme".to_string(), "app".to_string()))
        );
        assert_eq!(
            parse_repo_url("git@git.example.io:team/tool"),
            Some(("team".to_string(), "tool".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_repo_url("not a url"), None);
        assert_eq!(parse_repo_url("https://github.com/only-owner"), None);
    }

    #[test]
    fn test_pr_info_from() {
        let body = json!({
            "number": 12,
            "title": "Add feature",
            "html_url": "https://github.com/acme/app/pull/12",
            "state": "open",
            "created_at": "2026-07-30T12:00:00Z",
        });
        let info = pr_info_from(&body).unwrap();
        assert_eq!(info.number, 12);
        assert_eq!(info.state.as_deref(), Some("open"));
        assert_eq!(info.created_at.as_deref(), Some("2026-07-30T12:00:00Z"));

        assert!(pr_info_from(&json!({"title": "x"})).is_err());
    }
}
