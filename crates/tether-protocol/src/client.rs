//! Client-facing frames.
//!
//! Clients are human users attached over WebSocket. Inbound frames are small
//! commands; outbound frames mirror every durable state change plus a few
//! ephemeral streams (chunks, agent status).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::TranscriptMessage;

// ============================================================================
// Inbound (client -> session)
// ============================================================================

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Submit a prompt for the runner.
    Prompt {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Answer a pending question.
    #[serde(rename_all = "camelCase")]
    Answer { question_id: String, answer: String },

    /// Keepalive; answered with `pong`.
    Ping,

    /// Abort the in-flight turn and clear the queue.
    Abort,

    /// Delete the transcript suffix starting at the given message.
    #[serde(rename_all = "camelCase")]
    Revert { message_id: String },

    /// Ask the runner for the current workspace diff.
    #[serde(rename_all = "camelCase")]
    Diff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Ask the runner to review the current changes.
    #[serde(rename_all = "camelCase")]
    Review {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

// ============================================================================
// Outbound (session -> client)
// ============================================================================

/// Directory-resolved identity of a connected user, sent in the `init` roster
/// and `user.joined` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// One changed file reported by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub status: String,
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
}

/// A pending question surfaced to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionFrame {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Frames the session sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// First frame after accept: full session snapshot.
    #[serde(rename_all = "camelCase")]
    Init {
        messages: Vec<TranscriptMessage>,
        status: String,
        has_sandbox: bool,
        runner_connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        models: Option<Value>,
        users: Vec<ConnectedUser>,
        audit_log: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// A new transcript message.
    Message { message: TranscriptMessage },

    /// An existing transcript message changed (tool-call upsert).
    #[serde(rename = "message.updated")]
    MessageUpdated { message: TranscriptMessage },

    /// A contiguous transcript suffix was reverted.
    #[serde(rename = "messages.removed")]
    MessagesRemoved { ids: Vec<String> },

    /// Streaming partial assistant output; never persisted.
    Chunk { content: String },

    /// A question awaiting an answer.
    Question { question: QuestionFrame },

    /// Session status change. Only the fields that changed are present.
    #[serde(rename_all = "camelCase")]
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lifecycle: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner_connected: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        question_expired: Option<String>,
    },

    Pong,

    Error { message: String },

    #[serde(rename = "user.joined")]
    UserJoined { user: ConnectedUser },

    #[serde(rename = "user.left")]
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },

    /// Runner activity indicator, forwarded verbatim.
    #[serde(rename = "agentStatus")]
    AgentStatus { activity: Value },

    /// Discovered model catalogue.
    Models { models: Value },

    /// Workspace diff, correlated by request id.
    #[serde(rename_all = "camelCase")]
    Diff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        diff: Value,
    },

    /// Review output, correlated by request id.
    #[serde(rename = "review-result")]
    #[serde(rename_all = "camelCase")]
    ReviewResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        result: Value,
    },

    /// Git state (branch, PR metadata) changed.
    #[serde(rename = "git-state")]
    GitState { state: Value },

    /// A pull request was created.
    #[serde(rename = "pr-created")]
    PrCreated { pr: Value },

    /// The runner reported the set of changed files.
    #[serde(rename = "files-changed")]
    FilesChanged { files: Vec<FileChange> },

    /// A child session was spawned or updated.
    #[serde(rename = "child-session")]
    #[serde(rename_all = "camelCase")]
    ChildSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Session title changed.
    Title { title: String },

    /// Replay of audit entries for late joiners.
    #[serde(rename = "audit_log")]
    AuditLog { entries: Vec<Value> },

    /// The runner failed over to a different model.
    #[serde(rename = "model-switched")]
    ModelSwitched {
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_parse() {
        let frame: ClientMessage =
            serde_json::from_str(r#"{"type":"prompt","content":"hi","model":"m-lite"}"#).unwrap();
        match frame {
            ClientMessage::Prompt { content, model } => {
                assert_eq!(content, "hi");
                assert_eq!(model.as_deref(), Some("m-lite"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_revert_wire_name() {
        let frame: ClientMessage =
            serde_json::from_str(r#"{"type":"revert","messageId":"m7"}"#).unwrap();
        assert!(matches!(frame, ClientMessage::Revert { message_id } if message_id == "m7"));
    }

    #[test]
    fn test_dotted_event_names() {
        let ev = ClientEvent::MessagesRemoved {
            ids: vec!["a".to_string(), "b".to_string()],
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"messages.removed\""));

        let ev = ClientEvent::UserLeft {
            user_id: "u1".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"user.left\""));
        assert!(json.contains("\"userId\":\"u1\""));
    }

    #[test]
    fn test_status_frame_omits_absent_fields() {
        let ev = ClientEvent::Status {
            lifecycle: None,
            runner_connected: Some(true),
            question_expired: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(json, r#"{"type":"status","runnerConnected":true}"#);
    }

    #[test]
    fn test_unknown_inbound_field_ignored() {
        let frame: ClientMessage =
            serde_json::from_str(r#"{"type":"abort","nonce":123}"#).unwrap();
        assert!(matches!(frame, ClientMessage::Abort));
    }
}
