//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::HashMap;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Sandbox is being provisioned.
    Initializing,
    /// Sandbox is up and the runner may connect.
    Running,
    /// Snapshot in progress.
    Hibernating,
    /// Snapshotted and parked; a prompt or `wake` restores it.
    Hibernated,
    /// Restore from snapshot in progress.
    Restoring,
    /// Sandbox gone for good. Terminal.
    Terminated,
    /// Irrecoverable failure. Terminal.
    Error,
}

impl SessionStatus {
    /// Whether no further lifecycle transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Hibernating => write!(f, "hibernating"),
            Self::Hibernated => write!(f, "hibernated"),
            Self::Restoring => write!(f, "restoring"),
            Self::Terminated => write!(f, "terminated"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "hibernating" => Ok(Self::Hibernating),
            "hibernated" => Ok(Self::Hibernated),
            "restoring" => Ok(Self::Restoring),
            "terminated" => Ok(Self::Terminated),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Reverse-proxy URLs into the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUrls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    /// Generic in-sandbox gateway, target of `/proxy/*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// The provisioner payload stored at start and replayed on restore.
///
/// Only the environment map is interpreted (child spawning injects tokens and
/// git identity into it); everything else passes through opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Body of the `start` control call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub user_id: String,
    pub workspace: String,
    pub runner_token: String,

    /// Inline sandbox info; when present no provisioner spawn happens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnels: Option<TunnelUrls>,

    // Provisioner endpoints for this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hibernate_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_request: Option<SpawnRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_model: Option<String>,
}

/// Observability snapshot returned by `status` and most control calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnels: Option<TunnelUrls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub runner_connected: bool,
    pub runner_busy: bool,
    pub queue_depth: i64,
    pub pending_questions: i64,
    pub connected_users: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Prompt queue entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    Queued,
    Processing,
    Completed,
}

impl std::fmt::Display for PromptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for PromptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("unknown prompt status: {}", s)),
        }
    }
}

impl TryFrom<String> for PromptStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A prompt waiting for (or held by) the runner. The id equals the id of the
/// user message the prompt was recorded as.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    pub id: String,
    pub content: String,
    pub model: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: PromptStatus,
    pub author_id: Option<String>,
    pub author_email: Option<String>,
    pub author_name: Option<String>,
    pub created_at: String,
}

/// Question lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Expired,
}

impl std::fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Answered => write!(f, "answered"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for QuestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "answered" => Ok(Self::Answered),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown question status: {}", s)),
        }
    }
}

impl TryFrom<String> for QuestionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A runner question awaiting a human answer.
#[derive(Debug, Clone, FromRow)]
pub struct Question {
    pub id: String,
    pub text: String,
    /// JSON array of option strings, when the runner offered choices.
    pub options: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

impl Question {
    pub fn options_vec(&self) -> Vec<String> {
        self.options
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// One audit log row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub event: String,
    pub summary: String,
    pub actor: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
    pub flushed: bool,
}

impl AuditEntry {
    /// Wire shape used in `audit_log` frames and the `init` replay.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "seq": self.seq,
            "event": self.event,
            "summary": self.summary,
            "actor": self.actor,
            "metadata": self
                .metadata
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
            "createdAt": self.created_at,
        })
    }
}

/// Why a session stopped; forwarded to the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserStopped,
    Completed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserStopped => "user_stopped",
            Self::Completed => "completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            SessionStatus::Initializing,
            SessionStatus::Running,
            SessionStatus::Hibernating,
            SessionStatus::Hibernated,
            SessionStatus::Restoring,
            SessionStatus::Terminated,
            SessionStatus::Error,
        ] {
            let parsed: SessionStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Hibernated.is_terminal());
    }

    #[test]
    fn test_spawn_request_preserves_unknown_fields() {
        let json = r#"{"image":"dev:latest","cpus":4,"env":{"FOO":"bar"}}"#;
        let req: SpawnRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(req.rest.get("image").and_then(|v| v.as_str()), Some("dev:latest"));

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["cpus"], 4);
        assert_eq!(back["env"]["FOO"], "bar");
    }

    #[test]
    fn test_question_options() {
        let q = Question {
            id: "q1".to_string(),
            text: "pick one".to_string(),
            options: Some(r#"["a","b"]"#.to_string()),
            status: QuestionStatus::Pending,
            answer: None,
            created_at: String::new(),
            expires_at: String::new(),
        };
        assert_eq!(q.options_vec(), vec!["a".to_string(), "b".to_string()]);
    }
}
