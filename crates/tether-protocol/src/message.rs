//! Transcript message model.
//!
//! Messages are the persistent units of a session transcript. They are stored
//! in the session's local database and broadcast to clients verbatim, so the
//! struct below is both the storage shape and the wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// Progress of a tool invocation reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    /// Whether the call has reached a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Structured annotations attached to a message.
///
/// Carried as a tagged blob so a plain text message stays a plain text
/// message. Covers progressive tool-call state, screenshots, and provenance
/// of messages forwarded from another session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageParts {
    /// Tool invocation state, upserted by call id as the runner reports
    /// progress.
    Tool {
        name: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Base64 screenshot payload captured by the runner.
    Screenshot {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// Provenance marker for a message copied in from another session.
    #[serde(rename_all = "camelCase")]
    Forwarded {
        source_session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_title: Option<String>,
        original_role: Role,
        original_created_at: DateTime<Utc>,
    },
}

/// A transcript message.
///
/// Ids are unique and opaque. Tool messages reuse the runner-supplied call id
/// so progressive updates land on the same row; all other roles are
/// insert-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    pub id: String,
    pub role: Role,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<MessageParts>,

    // Author attribution, populated for user messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_avatar: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl TranscriptMessage {
    /// A message with no author attribution or parts.
    pub fn bare(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            parts: None,
            author_id: None,
            author_email: None,
            author_name: None,
            author_avatar: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = TranscriptMessage {
            id: "m1".to_string(),
            role: Role::User,
            content: "hello".to_string(),
            parts: None,
            author_id: Some("u1".to_string()),
            author_email: Some("u1@example.com".to_string()),
            author_name: Some("Sam".to_string()),
            author_avatar: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"authorId\":\"u1\""));
        // Absent optionals are omitted entirely.
        assert!(!json.contains("authorAvatar"));

        let parsed: TranscriptMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "m1");
        assert_eq!(parsed.role, Role::User);
    }

    #[test]
    fn test_tool_parts() {
        let parts = MessageParts::Tool {
            name: "bash".to_string(),
            status: ToolCallStatus::Completed,
            args: Some(serde_json::json!({"command": "ls"})),
            result: Some(serde_json::json!({"ok": true})),
        };

        let json = serde_json::to_string(&parts).unwrap();
        assert!(json.contains("\"kind\":\"tool\""));
        assert!(json.contains("\"status\":\"completed\""));

        let parsed: MessageParts = serde_json::from_str(&json).unwrap();
        match parsed {
            MessageParts::Tool { name, status, .. } => {
                assert_eq!(name, "bash");
                assert!(status.is_final());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_forwarded_parts_wire_names() {
        let parts = MessageParts::Forwarded {
            source_session_id: "s-src".to_string(),
            source_title: Some("lint run".to_string()),
            original_role: Role::Assistant,
            original_created_at: Utc::now(),
        };

        let json = serde_json::to_string(&parts).unwrap();
        assert!(json.contains("\"sourceSessionId\":\"s-src\""));
        assert!(json.contains("\"originalRole\":\"assistant\""));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"id":"m2","role":"system","content":"x","createdAt":"2026-01-01T00:00:00Z","futureField":42}"#;
        let parsed: TranscriptMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.role, Role::System);
    }
}
