//! The directory: the shared relational store of sessions, users, git state,
//! tokens, and catalogues.
//!
//! The session agent treats it as an external collaborator with a narrow
//! contract; every write is a single statement and no transaction spans the
//! boundary. `HttpDirectory` talks to the real service, `MemoryDirectory`
//! backs tests and `--local` single-node mode.

mod http;
mod memory;
mod types;

pub use http::HttpDirectory;
pub use memory::MemoryDirectory;
pub use types::{
    AuditSinkEntry, DirectorySession, GitState, GitStatePatch, MemoryRow, OrgRepo, Persona,
    UserProfile,
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    ConnectionFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("directory returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse directory response: {0}")]
    Parse(String),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Narrow contract over the directory tables the session agent touches.
#[async_trait]
pub trait Directory: Send + Sync {
    // -- sessions --
    async fn upsert_session(&self, row: DirectorySession) -> DirectoryResult<()>;
    async fn get_session(&self, id: &str) -> DirectoryResult<Option<DirectorySession>>;
    async fn update_session_status(&self, id: &str, status: &str) -> DirectoryResult<()>;
    async fn set_session_title(&self, id: &str, title: &str) -> DirectoryResult<()>;
    async fn add_active_seconds(&self, id: &str, seconds: i64) -> DirectoryResult<()>;
    async fn children_of(&self, id: &str) -> DirectoryResult<Vec<DirectorySession>>;

    // -- git state / file changes --
    async fn get_git_state(&self, session_id: &str) -> DirectoryResult<Option<GitState>>;
    async fn update_git_state(
        &self,
        session_id: &str,
        patch: GitStatePatch,
    ) -> DirectoryResult<()>;
    async fn upsert_file_change(
        &self,
        session_id: &str,
        path: &str,
        status: &str,
        additions: i64,
        deletions: i64,
    ) -> DirectoryResult<()>;

    // -- users / tokens / models --
    async fn user_profile(&self, user_id: &str) -> DirectoryResult<Option<UserProfile>>;
    /// Sealed OAuth token for the given provider, if the user linked one.
    async fn oauth_token(&self, user_id: &str, provider: &str) -> DirectoryResult<Option<String>>;
    async fn model_preferences(&self, user_id: &str) -> DirectoryResult<Vec<String>>;
    async fn save_model_catalogue(&self, user_id: &str, models: Value) -> DirectoryResult<()>;

    // -- orchestrator memory --
    async fn memory_read(
        &self,
        user_id: &str,
        query: Option<&str>,
        limit: u32,
    ) -> DirectoryResult<Vec<MemoryRow>>;
    async fn memory_write(
        &self,
        user_id: &str,
        content: &str,
        tags: &[String],
    ) -> DirectoryResult<MemoryRow>;
    async fn memory_delete(&self, user_id: &str, id: &str) -> DirectoryResult<bool>;
    async fn boost_memory(&self, user_id: &str, id: &str) -> DirectoryResult<()>;

    // -- catalogues --
    async fn org_repos(&self) -> DirectoryResult<Vec<OrgRepo>>;
    async fn personas(&self) -> DirectoryResult<Vec<Persona>>;

    // -- audit sink --
    async fn append_audit(
        &self,
        session_id: &str,
        entries: &[AuditSinkEntry],
    ) -> DirectoryResult<()>;
}
