//! In-memory directory for tests and single-node mode.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Mutex;
use uuid::Uuid;

use super::types::*;
use super::{Directory, DirectoryError, DirectoryResult};

/// DashMap-backed directory. Cloning shares nothing; wrap in `Arc`.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    sessions: DashMap<String, DirectorySession>,
    git_states: DashMap<String, GitState>,
    file_changes: DashMap<String, Vec<(String, String, i64, i64)>>,
    users: DashMap<String, UserProfile>,
    oauth_tokens: DashMap<(String, String), String>,
    model_preferences: DashMap<String, Vec<String>>,
    model_catalogues: DashMap<String, Value>,
    memories: DashMap<String, Vec<MemoryRow>>,
    repos: Mutex<Vec<OrgRepo>>,
    persona_rows: Mutex<Vec<Persona>>,
    audit: DashMap<String, Vec<AuditSinkEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding helpers for tests and local mode --

    pub fn seed_user(&self, user: UserProfile) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn seed_oauth_token(&self, user_id: &str, provider: &str, sealed_token: &str) {
        self.oauth_tokens.insert(
            (user_id.to_string(), provider.to_string()),
            sealed_token.to_string(),
        );
    }

    pub fn seed_model_preferences(&self, user_id: &str, prefs: Vec<String>) {
        self.model_preferences.insert(user_id.to_string(), prefs);
    }

    pub fn seed_repos(&self, repos: Vec<OrgRepo>) {
        *self.repos.lock().unwrap() = repos;
    }

    pub fn seed_personas(&self, personas: Vec<Persona>) {
        *self.persona_rows.lock().unwrap() = personas;
    }

    pub fn seed_git_state(&self, session_id: &str, state: GitState) {
        self.git_states.insert(session_id.to_string(), state);
    }

    // -- inspection helpers for tests --

    pub fn session(&self, id: &str) -> Option<DirectorySession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn git_state(&self, session_id: &str) -> Option<GitState> {
        self.git_states.get(session_id).map(|s| s.clone())
    }

    pub fn audit_entries(&self, session_id: &str) -> Vec<AuditSinkEntry> {
        self.audit
            .get(session_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn active_seconds(&self, session_id: &str) -> i64 {
        self.sessions
            .get(session_id)
            .map(|s| s.active_seconds)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn upsert_session(&self, row: DirectorySession) -> DirectoryResult<()> {
        self.sessions.insert(row.id.clone(), row);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> DirectoryResult<Option<DirectorySession>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn update_session_status(&self, id: &str, status: &str) -> DirectoryResult<()> {
        let mut row = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| DirectoryError::SessionNotFound(id.to_string()))?;
        row.status = status.to_string();
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn set_session_title(&self, id: &str, title: &str) -> DirectoryResult<()> {
        if let Some(mut row) = self.sessions.get_mut(id) {
            row.title = Some(title.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn add_active_seconds(&self, id: &str, seconds: i64) -> DirectoryResult<()> {
        if let Some(mut row) = self.sessions.get_mut(id) {
            row.active_seconds += seconds;
        }
        Ok(())
    }

    async fn children_of(&self, id: &str) -> DirectoryResult<Vec<DirectorySession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| entry.parent_session_id.as_deref() == Some(id))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn get_git_state(&self, session_id: &str) -> DirectoryResult<Option<GitState>> {
        Ok(self.git_states.get(session_id).map(|s| s.clone()))
    }

    async fn update_git_state(
        &self,
        session_id: &str,
        patch: GitStatePatch,
    ) -> DirectoryResult<()> {
        let mut entry = self.git_states.entry(session_id.to_string()).or_default();
        patch.apply(&mut entry);
        Ok(())
    }

    async fn upsert_file_change(
        &self,
        session_id: &str,
        path: &str,
        status: &str,
        additions: i64,
        deletions: i64,
    ) -> DirectoryResult<()> {
        let mut files = self.file_changes.entry(session_id.to_string()).or_default();
        if let Some(existing) = files.iter_mut().find(|(p, ..)| p == path) {
            *existing = (path.to_string(), status.to_string(), additions, deletions);
        } else {
            files.push((path.to_string(), status.to_string(), additions, deletions));
        }
        Ok(())
    }

    async fn user_profile(&self, user_id: &str) -> DirectoryResult<Option<UserProfile>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn oauth_token(&self, user_id: &str, provider: &str) -> DirectoryResult<Option<String>> {
        Ok(self
            .oauth_tokens
            .get(&(user_id.to_string(), provider.to_string()))
            .map(|t| t.clone()))
    }

    async fn model_preferences(&self, user_id: &str) -> DirectoryResult<Vec<String>> {
        Ok(self
            .model_preferences
            .get(user_id)
            .map(|p| p.clone())
            .unwrap_or_default())
    }

    async fn save_model_catalogue(&self, user_id: &str, models: Value) -> DirectoryResult<()> {
        self.model_catalogues.insert(user_id.to_string(), models);
        Ok(())
    }

    async fn memory_read(
        &self,
        user_id: &str,
        query: Option<&str>,
        limit: u32,
    ) -> DirectoryResult<Vec<MemoryRow>> {
        let rows = self
            .memories
            .get(user_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        let mut matched: Vec<MemoryRow> = rows
            .into_iter()
            .filter(|row| match query {
                Some(q) => row.content.to_lowercase().contains(&q.to_lowercase()),
                None => true,
            })
            .collect();
        matched.sort_by(|a, b| b.relevance.cmp(&a.relevance));
        matched.truncate(limit as usize);
        Ok(matched)
    }

    async fn memory_write(
        &self,
        user_id: &str,
        content: &str,
        tags: &[String],
    ) -> DirectoryResult<MemoryRow> {
        let row = MemoryRow {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            tags: tags.to_vec(),
            relevance: 0,
            created_at: Utc::now(),
        };
        self.memories
            .entry(user_id.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn memory_delete(&self, user_id: &str, id: &str) -> DirectoryResult<bool> {
        if let Some(mut rows) = self.memories.get_mut(user_id) {
            let before = rows.len();
            rows.retain(|row| row.id != id);
            return Ok(rows.len() < before);
        }
        Ok(false)
    }

    async fn boost_memory(&self, user_id: &str, id: &str) -> DirectoryResult<()> {
        if let Some(mut rows) = self.memories.get_mut(user_id) {
            if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
                row.relevance += 1;
            }
        }
        Ok(())
    }

    async fn org_repos(&self) -> DirectoryResult<Vec<OrgRepo>> {
        Ok(self.repos.lock().unwrap().clone())
    }

    async fn personas(&self) -> DirectoryResult<Vec<Persona>> {
        Ok(self.persona_rows.lock().unwrap().clone())
    }

    async fn append_audit(
        &self,
        session_id: &str,
        entries: &[AuditSinkEntry],
    ) -> DirectoryResult<()> {
        self.audit
            .entry(session_id.to_string())
            .or_default()
            .extend(entries.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_row(id: &str, user: &str, parent: Option<&str>) -> DirectorySession {
        DirectorySession {
            id: id.to_string(),
            user_id: user.to_string(),
            workspace: "/w".to_string(),
            status: "running".to_string(),
            title: None,
            parent_session_id: parent.map(|p| p.to_string()),
            active_seconds: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_children_lookup() {
        let dir = MemoryDirectory::new();
        dir.upsert_session(session_row("parent", "u1", None))
            .await
            .unwrap();
        dir.upsert_session(session_row("child-a", "u1", Some("parent")))
            .await
            .unwrap();
        dir.upsert_session(session_row("other", "u2", None))
            .await
            .unwrap();

        let children = dir.children_of("parent").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "child-a");
    }

    #[tokio::test]
    async fn test_memory_relevance_boost() {
        let dir = MemoryDirectory::new();
        let a = dir.memory_write("u1", "prefers rebase", &[]).await.unwrap();
        dir.memory_write("u1", "likes short names", &[]).await.unwrap();

        dir.boost_memory("u1", &a.id).await.unwrap();
        let rows = dir.memory_read("u1", None, 10).await.unwrap();
        assert_eq!(rows[0].id, a.id);

        assert!(dir.memory_delete("u1", &a.id).await.unwrap());
        assert!(!dir.memory_delete("u1", &a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_git_state_patch() {
        let dir = MemoryDirectory::new();
        dir.update_git_state(
            "s1",
            GitStatePatch {
                branch: Some("feat-x".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        dir.update_git_state(
            "s1",
            GitStatePatch {
                commit_count: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let state = dir.git_state("s1").unwrap();
        assert_eq!(state.branch.as_deref(), Some("feat-x"));
        assert_eq!(state.commit_count, Some(3));
    }
}
