//! Row shapes for the external directory service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A session row as the directory sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySession {
    pub id: String,
    pub user_id: String,
    pub workspace: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub active_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user row, including the git identity used for commit attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_email: Option<String>,
}

/// The session's git-state row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_merged_at: Option<String>,
}

/// Partial git-state update; only present fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_merged_at: Option<String>,
}

impl GitStatePatch {
    pub fn is_empty(&self) -> bool {
        self.repo_url.is_none()
            && self.branch.is_none()
            && self.base_branch.is_none()
            && self.commit_count.is_none()
            && self.pr_number.is_none()
            && self.pr_url.is_none()
            && self.pr_state.is_none()
            && self.pr_title.is_none()
            && self.pr_created_at.is_none()
            && self.pr_merged_at.is_none()
    }

    pub fn apply(&self, state: &mut GitState) {
        if let Some(v) = &self.repo_url {
            state.repo_url = Some(v.clone());
        }
        if let Some(v) = &self.branch {
            state.branch = Some(v.clone());
        }
        if let Some(v) = &self.base_branch {
            state.base_branch = Some(v.clone());
        }
        if let Some(v) = self.commit_count {
            state.commit_count = Some(v);
        }
        if let Some(v) = self.pr_number {
            state.pr_number = Some(v);
        }
        if let Some(v) = &self.pr_url {
            state.pr_url = Some(v.clone());
        }
        if let Some(v) = &self.pr_state {
            state.pr_state = Some(v.clone());
        }
        if let Some(v) = &self.pr_title {
            state.pr_title = Some(v.clone());
        }
        if let Some(v) = &self.pr_created_at {
            state.pr_created_at = Some(v.clone());
        }
        if let Some(v) = &self.pr_merged_at {
            state.pr_merged_at = Some(v.clone());
        }
    }
}

/// One orchestrator-memory row, scoped to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRow {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relevance: i64,
    pub created_at: DateTime<Utc>,
}

/// A configured agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A repository from the organisation catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgRepo {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

/// Audit entry shape pushed to the directory sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSinkEntry {
    pub event: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: String,
}
