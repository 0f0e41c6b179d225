//! Runner-facing frames.
//!
//! The runner is the single automated agent inside the sandbox. It reports
//! streaming output, tool calls, questions, and git state, and may issue
//! cross-session RPCs. Every RPC is tagged with a `requestId` and answered
//! with exactly one `*-result` frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::FileChange;
use crate::message::ToolCallStatus;

// ============================================================================
// Inbound (runner -> session)
// ============================================================================

/// Frames the runner may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunnerMessage {
    /// Streaming partial assistant output.
    Stream { content: String },

    /// Final assistant content for the current turn.
    Result { content: String },

    /// Tool invocation progress, upserted by call id.
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        name: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    /// Ask the humans something; expires after five minutes unanswered.
    Question {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },

    /// Screenshot captured inside the sandbox, base64-encoded.
    Screenshot {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// Agent-side failure; persisted and surfaced to clients.
    Error { message: String },

    /// Current turn finished; the prompt queue may drain.
    Complete,

    /// Activity indicator, forwarded to clients verbatim.
    #[serde(rename = "agentStatus")]
    AgentStatus { activity: Value },

    /// Acknowledgement of an `abort` command.
    Aborted,

    /// Acknowledgement of a `revert` command.
    Reverted,

    /// Workspace diff answering a `diff` command.
    #[serde(rename_all = "camelCase")]
    Diff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        diff: Value,
    },

    /// Review output answering a `review` command.
    #[serde(rename = "review-result")]
    #[serde(rename_all = "camelCase")]
    ReviewResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        result: Value,
    },

    /// Discovered model catalogue.
    Models { models: Value },

    /// The runner failed over to a different model.
    #[serde(rename = "model-switched")]
    ModelSwitched {
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Branch / base / commit-count update from the sandbox checkout.
    #[serde(rename = "git-state")]
    #[serde(rename_all = "camelCase")]
    GitState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_count: Option<i64>,
    },

    /// The runner opened a pull request itself.
    #[serde(rename = "pr-created")]
    PrCreated { pr: PrInfo },

    /// Set of files changed in the workspace.
    #[serde(rename = "files-changed")]
    FilesChanged { files: Vec<FileChange> },

    /// Notification about a child session (forwarded to clients).
    #[serde(rename = "child-session")]
    #[serde(rename_all = "camelCase")]
    ChildSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Session title chosen by the runner.
    Title { title: String },

    // ========== Git-provider RPCs ==========
    #[serde(rename = "create-pr")]
    #[serde(rename_all = "camelCase")]
    CreatePr {
        request_id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head: Option<String>,
        #[serde(default)]
        draft: bool,
    },

    #[serde(rename = "update-pr")]
    #[serde(rename_all = "camelCase")]
    UpdatePr {
        request_id: String,
        number: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },

    #[serde(rename = "list-pull-requests")]
    #[serde(rename_all = "camelCase")]
    ListPullRequests {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    #[serde(rename = "inspect-pull-request")]
    #[serde(rename_all = "camelCase")]
    InspectPullRequest {
        request_id: String,
        number: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    // ========== Cross-session RPCs ==========
    #[serde(rename = "spawn-child")]
    #[serde(rename_all = "camelCase")]
    SpawnChild {
        request_id: String,
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },

    #[serde(rename = "session-message")]
    #[serde(rename_all = "camelCase")]
    SessionMessage {
        request_id: String,
        session_id: String,
        content: String,
        #[serde(default)]
        interrupt: bool,
    },

    #[serde(rename = "session-messages")]
    #[serde(rename_all = "camelCase")]
    SessionMessages {
        request_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },

    #[serde(rename = "forward-messages")]
    #[serde(rename_all = "camelCase")]
    ForwardMessages {
        request_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
    },

    #[serde(rename = "terminate-child")]
    #[serde(rename_all = "camelCase")]
    TerminateChild {
        request_id: String,
        session_id: String,
    },

    #[serde(rename = "self-terminate")]
    #[serde(rename_all = "camelCase")]
    SelfTerminate { request_id: String },

    #[serde(rename = "get-session-status")]
    #[serde(rename_all = "camelCase")]
    GetSessionStatus {
        request_id: String,
        session_id: String,
    },

    #[serde(rename = "list-child-sessions")]
    #[serde(rename_all = "camelCase")]
    ListChildSessions { request_id: String },

    // ========== Directory RPCs ==========
    #[serde(rename = "memory-read")]
    #[serde(rename_all = "camelCase")]
    MemoryRead {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    #[serde(rename = "memory-write")]
    #[serde(rename_all = "camelCase")]
    MemoryWrite {
        request_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },

    #[serde(rename = "memory-delete")]
    #[serde(rename_all = "camelCase")]
    MemoryDelete { request_id: String, id: String },

    #[serde(rename = "list-repos")]
    #[serde(rename_all = "camelCase")]
    ListRepos {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },

    #[serde(rename = "list-personas")]
    #[serde(rename_all = "camelCase")]
    ListPersonas { request_id: String },

    Ping,
}

/// Pull-request metadata as reported by the runner or the provider bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrInfo {
    pub number: i64,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Provider-reported creation timestamp (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

// ============================================================================
// Outbound (session -> runner)
// ============================================================================

/// Identity of the user whose prompt is being dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAuthor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Git identity the runner should commit as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Result payload shared by every `*-result` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcOutcome {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcOutcome {
    pub fn ok(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The RPC families a runner frame can open, used to pick the result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    CreatePr,
    UpdatePr,
    ListPullRequests,
    InspectPullRequest,
    SpawnChild,
    SessionMessage,
    SessionMessages,
    ForwardMessages,
    TerminateChild,
    SelfTerminate,
    GetSessionStatus,
    ListChildSessions,
    MemoryRead,
    MemoryWrite,
    MemoryDelete,
    ListRepos,
    ListPersonas,
}

/// Frames the session sends to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunnerCommand {
    /// Dispatch a prompt. Carries full author attribution and the owner's
    /// ordered model preferences for provider fail-over.
    #[serde(rename_all = "camelCase")]
    Prompt {
        id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        author: PromptAuthor,
        git_identity: GitIdentity,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        model_preferences: Vec<String>,
    },

    /// Deliver an answer (or the synthetic `__expired__`) for a question.
    #[serde(rename_all = "camelCase")]
    Answer { question_id: String, answer: String },

    /// The session is terminating; shut down cleanly.
    Stop,

    /// Abort the in-flight turn.
    Abort,

    /// Drop internal history from the given message onward.
    #[serde(rename_all = "camelCase")]
    Revert { message_id: String },

    /// Request the current workspace diff.
    #[serde(rename_all = "camelCase")]
    Diff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Request a review of the current changes.
    #[serde(rename_all = "camelCase")]
    Review {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Pong,

    #[serde(rename = "create-pr-result")]
    CreatePrResult(RpcOutcome),
    #[serde(rename = "update-pr-result")]
    UpdatePrResult(RpcOutcome),
    #[serde(rename = "list-pull-requests-result")]
    ListPullRequestsResult(RpcOutcome),
    #[serde(rename = "inspect-pull-request-result")]
    InspectPullRequestResult(RpcOutcome),
    #[serde(rename = "spawn-child-result")]
    SpawnChildResult(RpcOutcome),
    #[serde(rename = "session-message-result")]
    SessionMessageResult(RpcOutcome),
    #[serde(rename = "session-messages-result")]
    SessionMessagesResult(RpcOutcome),
    #[serde(rename = "forward-messages-result")]
    ForwardMessagesResult(RpcOutcome),
    #[serde(rename = "terminate-child-result")]
    TerminateChildResult(RpcOutcome),
    #[serde(rename = "self-terminate-result")]
    SelfTerminateResult(RpcOutcome),
    #[serde(rename = "get-session-status-result")]
    GetSessionStatusResult(RpcOutcome),
    #[serde(rename = "list-child-sessions-result")]
    ListChildSessionsResult(RpcOutcome),
    #[serde(rename = "memory-read-result")]
    MemoryReadResult(RpcOutcome),
    #[serde(rename = "memory-write-result")]
    MemoryWriteResult(RpcOutcome),
    #[serde(rename = "memory-delete-result")]
    MemoryDeleteResult(RpcOutcome),
    #[serde(rename = "list-repos-result")]
    ListReposResult(RpcOutcome),
    #[serde(rename = "list-personas-result")]
    ListPersonasResult(RpcOutcome),
}

impl RunnerCommand {
    /// Wrap an outcome in the result frame matching the originating RPC kind.
    pub fn rpc_result(kind: RpcKind, outcome: RpcOutcome) -> Self {
        match kind {
            RpcKind::CreatePr => Self::CreatePrResult(outcome),
            RpcKind::UpdatePr => Self::UpdatePrResult(outcome),
            RpcKind::ListPullRequests => Self::ListPullRequestsResult(outcome),
            RpcKind::InspectPullRequest => Self::InspectPullRequestResult(outcome),
            RpcKind::SpawnChild => Self::SpawnChildResult(outcome),
            RpcKind::SessionMessage => Self::SessionMessageResult(outcome),
            RpcKind::SessionMessages => Self::SessionMessagesResult(outcome),
            RpcKind::ForwardMessages => Self::ForwardMessagesResult(outcome),
            RpcKind::TerminateChild => Self::TerminateChildResult(outcome),
            RpcKind::SelfTerminate => Self::SelfTerminateResult(outcome),
            RpcKind::GetSessionStatus => Self::GetSessionStatusResult(outcome),
            RpcKind::ListChildSessions => Self::ListChildSessionsResult(outcome),
            RpcKind::MemoryRead => Self::MemoryReadResult(outcome),
            RpcKind::MemoryWrite => Self::MemoryWriteResult(outcome),
            RpcKind::MemoryDelete => Self::MemoryDeleteResult(outcome),
            RpcKind::ListRepos => Self::ListReposResult(outcome),
            RpcKind::ListPersonas => Self::ListPersonasResult(outcome),
        }
    }
}
