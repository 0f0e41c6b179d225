//! Cross-session coordinator and git-provider RPCs.
//!
//! Every runner RPC carries a `requestId` and is answered with exactly one
//! `*-result` frame. Cross-session calls validate ownership by dereferencing
//! the target in the directory and comparing user ids. A session cannot
//! target itself: the single-writer loop cannot await its own handle.

use chrono::Utc;
use log::{info, warn};
use rand::RngCore;
use serde_json::{Value, json};
use uuid::Uuid;

use tether_protocol::{
    ClientEvent, MessageParts, PromptAuthor, Role, RpcKind, RpcOutcome, RunnerCommand,
    RunnerMessage, TranscriptMessage,
};

use super::agent::SessionAgent;
use super::models::{SpawnRequest, StartRequest, StopReason};
use super::store::{keys, parse_ts};
use crate::directory::{DirectorySession, GitStatePatch};
use crate::github::parse_repo_url;

/// Upper bound on messages fetched across sessions in one call.
const MESSAGE_FETCH_CAP: u32 = 300;

impl SessionAgent {
    pub(crate) async fn handle_rpc(&mut self, frame: RunnerMessage) -> anyhow::Result<()> {
        let (kind, request_id, result) = match frame {
            RunnerMessage::CreatePr {
                request_id,
                title,
                body,
                base,
                head,
                draft,
            } => {
                let result = self.rpc_create_pr(title, body, base, head, draft).await;
                (RpcKind::CreatePr, request_id, result)
            }
            RunnerMessage::UpdatePr {
                request_id,
                number,
                title,
                body,
                state,
            } => {
                let result = self.rpc_update_pr(number, title, body, state).await;
                (RpcKind::UpdatePr, request_id, result)
            }
            RunnerMessage::ListPullRequests {
                request_id,
                state,
                limit,
            } => {
                let result = self.rpc_list_pull_requests(state, limit).await;
                (RpcKind::ListPullRequests, request_id, result)
            }
            RunnerMessage::InspectPullRequest {
                request_id,
                number,
                limit,
            } => {
                let result = self.rpc_inspect_pull_request(number, limit).await;
                (RpcKind::InspectPullRequest, request_id, result)
            }
            RunnerMessage::SpawnChild {
                request_id,
                task,
                workspace,
                repo_url,
                branch,
                model,
                env,
            } => {
                let result = self
                    .rpc_spawn_child(task, workspace, repo_url, branch, model, env)
                    .await;
                (RpcKind::SpawnChild, request_id, result)
            }
            RunnerMessage::SessionMessage {
                request_id,
                session_id,
                content,
                interrupt,
            } => {
                let result = self.rpc_session_message(session_id, content, interrupt).await;
                (RpcKind::SessionMessage, request_id, result)
            }
            RunnerMessage::SessionMessages {
                request_id,
                session_id,
                limit,
                after,
            } => {
                let result = self.rpc_session_messages(session_id, limit, after).await;
                (RpcKind::SessionMessages, request_id, result)
            }
            RunnerMessage::ForwardMessages {
                request_id,
                session_id,
                limit,
                after,
            } => {
                let result = self.rpc_forward_messages(session_id, limit, after).await;
                (RpcKind::ForwardMessages, request_id, result)
            }
            RunnerMessage::TerminateChild {
                request_id,
                session_id,
            } => {
                let result = self.rpc_terminate_child(session_id).await;
                (RpcKind::TerminateChild, request_id, result)
            }
            RunnerMessage::SelfTerminate { request_id } => {
                // Answer first; the stop path closes the runner socket.
                self.send_runner(RunnerCommand::rpc_result(
                    RpcKind::SelfTerminate,
                    RpcOutcome::ok(request_id, json!({ "terminating": true })),
                ));
                if let Err(e) = self.handle_stop(StopReason::Completed).await {
                    warn!("session {}: self-terminate stop failed: {}", self.id, e);
                }
                return Ok(());
            }
            RunnerMessage::GetSessionStatus {
                request_id,
                session_id,
            } => {
                let result = self.rpc_get_session_status(session_id).await;
                (RpcKind::GetSessionStatus, request_id, result)
            }
            RunnerMessage::ListChildSessions { request_id } => {
                let result = self.rpc_list_child_sessions().await;
                (RpcKind::ListChildSessions, request_id, result)
            }
            RunnerMessage::MemoryRead {
                request_id,
                query,
                limit,
            } => {
                let result = self.rpc_memory_read(query, limit).await;
                (RpcKind::MemoryRead, request_id, result)
            }
            RunnerMessage::MemoryWrite {
                request_id,
                content,
                tags,
            } => {
                let result = self.rpc_memory_write(content, tags).await;
                (RpcKind::MemoryWrite, request_id, result)
            }
            RunnerMessage::MemoryDelete { request_id, id } => {
                let result = self.rpc_memory_delete(id).await;
                (RpcKind::MemoryDelete, request_id, result)
            }
            RunnerMessage::ListRepos { request_id, source } => {
                let result = self.rpc_list_repos(source).await;
                (RpcKind::ListRepos, request_id, result)
            }
            RunnerMessage::ListPersonas { request_id } => {
                let result = self.rpc_list_personas().await;
                (RpcKind::ListPersonas, request_id, result)
            }
            other => {
                warn!("session {}: unexpected frame in RPC handler: {:?}", self.id, other);
                return Ok(());
            }
        };

        let outcome = match result {
            Ok(value) => RpcOutcome::ok(request_id, value),
            Err(message) => RpcOutcome::err(request_id, message),
        };
        self.send_runner(RunnerCommand::rpc_result(kind, outcome));
        Ok(())
    }

    // ========================================================================
    // Ownership and token resolution
    // ========================================================================

    /// Dereference a target session and require it to belong to this
    /// session's user.
    async fn owned_session(&self, target: &str) -> Result<DirectorySession, String> {
        if target == self.id {
            return Err("cannot target the calling session itself".to_string());
        }
        let own_user = self
            .owner_id()
            .await
            .map_err(|e| e.to_string())?;

        match self.deps.directory.get_session(target).await {
            Ok(Some(row)) if row.user_id == own_user => Ok(row),
            Ok(Some(_)) => Err("session belongs to a different user".to_string()),
            Ok(None) => Err(format!("unknown session: {}", target)),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Token resolution order: current prompt author, then session owner.
    async fn resolve_git_token(&self) -> Result<String, String> {
        let mut candidates = Vec::new();
        if let Ok(Some(author)) = self
            .store
            .get_state_json::<PromptAuthor>(keys::CURRENT_AUTHOR)
            .await
        {
            candidates.push(author.id);
        }
        if let Ok(owner) = self.owner_id().await {
            if !candidates.contains(&owner) {
                candidates.push(owner);
            }
        }

        for user_id in &candidates {
            if let Ok(Some(sealed)) = self.deps.directory.oauth_token(user_id, "github").await {
                match self.deps.sealer.unseal(&sealed) {
                    Ok(token) => return Ok(token),
                    Err(e) => warn!("session {}: token unseal failed for {}: {:#}", self.id, user_id, e),
                }
            }
        }

        Err("no git provider token available for the prompt author or session owner".to_string())
    }

    async fn source_repo(&self) -> Result<(String, String, crate::directory::GitState), String> {
        let git_state = self
            .deps
            .directory
            .get_git_state(&self.id)
            .await
            .map_err(|e| e.to_string())?
            .unwrap_or_default();
        let repo_url = git_state
            .repo_url
            .clone()
            .ok_or_else(|| "session has no source repository".to_string())?;
        let (owner, repo) = parse_repo_url(&repo_url)
            .ok_or_else(|| format!("cannot parse repository URL: {}", repo_url))?;
        Ok((owner, repo, git_state))
    }

    // ========================================================================
    // Git-provider bridge
    // ========================================================================

    async fn rpc_create_pr(
        &mut self,
        title: String,
        body: Option<String>,
        base: Option<String>,
        head: Option<String>,
        draft: bool,
    ) -> Result<Value, String> {
        let token = self.resolve_git_token().await?;
        let (owner, repo, git_state) = self.source_repo().await?;

        let head = head
            .or(git_state.branch.clone())
            .ok_or_else(|| "no head branch for pull request".to_string())?;
        let base = match base.or(git_state.base_branch.clone()) {
            Some(base) => base,
            None => self.deps.git.default_branch(&token, &owner, &repo).await,
        };

        let pr = self
            .deps
            .git
            .create_pr(
                &token,
                &owner,
                &repo,
                &title,
                body.as_deref(),
                &head,
                &base,
                draft,
            )
            .await
            .map_err(|e| format!("{:#}", e))?;

        self.record_pr_created(&pr).await;
        Ok(serde_json::to_value(&pr).unwrap_or_default())
    }

    async fn rpc_update_pr(
        &mut self,
        number: i64,
        title: Option<String>,
        body: Option<String>,
        state: Option<String>,
    ) -> Result<Value, String> {
        let token = self.resolve_git_token().await?;
        let (owner, repo, _) = self.source_repo().await?;

        let pr = self
            .deps
            .git
            .update_pr(
                &token,
                &owner,
                &repo,
                number,
                title.as_deref(),
                body.as_deref(),
                state.as_deref(),
            )
            .await
            .map_err(|e| format!("{:#}", e))?;

        if let Err(e) = self
            .deps
            .directory
            .update_git_state(
                &self.id,
                GitStatePatch {
                    pr_title: Some(pr.title.clone()),
                    pr_state: pr.state.clone(),
                    ..Default::default()
                },
            )
            .await
        {
            warn!("session {}: PR update git-state write failed: {}", self.id, e);
        }

        Ok(serde_json::to_value(&pr).unwrap_or_default())
    }

    async fn rpc_list_pull_requests(
        &self,
        state: Option<String>,
        limit: Option<u32>,
    ) -> Result<Value, String> {
        let token = self.resolve_git_token().await?;
        let (owner, repo, _) = self.source_repo().await?;
        self.deps
            .git
            .list_pull_requests(&token, &owner, &repo, state.as_deref(), limit.unwrap_or(50))
            .await
            .map_err(|e| format!("{:#}", e))
    }

    async fn rpc_inspect_pull_request(
        &self,
        number: i64,
        limit: Option<u32>,
    ) -> Result<Value, String> {
        let token = self.resolve_git_token().await?;
        let (owner, repo, _) = self.source_repo().await?;
        self.deps
            .git
            .inspect_pull_request(&token, &owner, &repo, number, limit.unwrap_or(100))
            .await
            .map_err(|e| format!("{:#}", e))
    }

    // ========================================================================
    // Child sessions
    // ========================================================================

    async fn rpc_spawn_child(
        &mut self,
        task: String,
        workspace: Option<String>,
        repo_url: Option<String>,
        branch: Option<String>,
        model: Option<String>,
        env_overrides: std::collections::HashMap<String, String>,
    ) -> Result<Value, String> {
        let owner = self.owner_id().await.map_err(|e| e.to_string())?;

        let backend_url = self
            .store
            .get_state(keys::BACKEND_URL)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "parent session has no provisioner endpoint".to_string())?;
        let parent_spawn = self
            .store
            .get_state_json::<SpawnRequest>(keys::SPAWN_REQUEST)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "parent session has no spawn request to inherit".to_string())?;

        let child_id = Uuid::new_v4().to_string();
        let runner_token = mint_runner_token();

        // Git context is inherited unless the caller overrides it.
        let parent_git = self
            .deps
            .directory
            .get_git_state(&self.id)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let child_repo = repo_url.or(parent_git.repo_url.clone());
        let child_branch = branch.or(parent_git.branch.clone());

        // Clone the environment, then fill in the blanks: a usable git token
        // and a git identity.
        let mut spawn_request = parent_spawn.clone();
        spawn_request.env.extend(env_overrides);

        if !spawn_request.env.contains_key("GITHUB_TOKEN") {
            if let Ok(Some(sealed)) = self.deps.directory.oauth_token(&owner, "github").await {
                match self.deps.sealer.unseal(&sealed) {
                    Ok(token) => {
                        spawn_request.env.insert("GITHUB_TOKEN".to_string(), token);
                    }
                    Err(e) => warn!("session {}: child token unseal failed: {:#}", self.id, e),
                }
            }
        }

        if let Ok(Some(profile)) = self.deps.directory.user_profile(&owner).await {
            if !spawn_request.env.contains_key("GIT_USER_NAME") {
                if let Some(name) = profile.git_name.or(profile.name) {
                    spawn_request.env.insert("GIT_USER_NAME".to_string(), name);
                }
            }
            if !spawn_request.env.contains_key("GIT_USER_EMAIL") {
                if let Some(email) = profile.git_email.or(profile.email) {
                    spawn_request.env.insert("GIT_USER_EMAIL".to_string(), email);
                }
            }
        }

        let child_workspace = match workspace {
            Some(workspace) => workspace,
            None => self
                .store
                .get_state(keys::WORKSPACE)
                .await
                .map_err(|e| e.to_string())?
                .unwrap_or_default(),
        };

        // Directory row first, carrying the parent pointer, so the child's
        // own start sees it and ownership checks resolve immediately.
        let now = Utc::now();
        self.deps
            .directory
            .upsert_session(DirectorySession {
                id: child_id.clone(),
                user_id: owner.clone(),
                workspace: child_workspace.clone(),
                status: "initializing".to_string(),
                title: None,
                parent_session_id: Some(self.id.clone()),
                active_seconds: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|e| e.to_string())?;

        if child_repo.is_some() || child_branch.is_some() {
            if let Err(e) = self
                .deps
                .directory
                .update_git_state(
                    &child_id,
                    GitStatePatch {
                        repo_url: child_repo,
                        branch: child_branch,
                        base_branch: parent_git.base_branch.clone(),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!("session {}: child git-state write failed: {}", self.id, e);
            }
        }

        let start = StartRequest {
            user_id: owner,
            workspace: child_workspace,
            runner_token,
            sandbox_id: None,
            tunnels: None,
            backend_url: Some(backend_url),
            terminate_url: self
                .store
                .get_state(keys::TERMINATE_URL)
                .await
                .map_err(|e| e.to_string())?,
            hibernate_url: self
                .store
                .get_state(keys::HIBERNATE_URL)
                .await
                .map_err(|e| e.to_string())?,
            restore_url: self
                .store
                .get_state(keys::RESTORE_URL)
                .await
                .map_err(|e| e.to_string())?,
            idle_timeout_ms: self
                .store
                .get_state(keys::IDLE_TIMEOUT_MS)
                .await
                .map_err(|e| e.to_string())?
                .and_then(|raw| raw.parse().ok()),
            spawn_request: Some(spawn_request),
            initial_prompt: Some(task),
            initial_model: model,
        };

        let handle = self
            .registry
            .ensure(&child_id)
            .await
            .map_err(|e| e.to_string())?;
        handle.start(start).await.map_err(|e| e.to_string())?;

        self.broadcast(ClientEvent::ChildSession {
            session_id: child_id.clone(),
            title: None,
        });
        self.audit(
            "child.spawned",
            &format!("spawned child session {}", child_id),
            Some("runner"),
            None,
        )
        .await;

        info!("session {}: spawned child {}", self.id, child_id);
        Ok(json!({ "sessionId": child_id }))
    }

    async fn rpc_session_message(
        &self,
        session_id: String,
        content: String,
        interrupt: bool,
    ) -> Result<Value, String> {
        self.owned_session(&session_id).await?;
        let own_user = self.owner_id().await.map_err(|e| e.to_string())?;

        let handle = self
            .registry
            .get(&session_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("session {} is not reachable", session_id))?;

        let message_id = handle
            .prompt(content, None, interrupt, Some(own_user))
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "messageId": message_id }))
    }

    async fn fetch_session_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
        after: Option<String>,
    ) -> Result<Vec<TranscriptMessage>, String> {
        let handle = self
            .registry
            .get(session_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("session {} is not reachable", session_id))?;

        let after = after
            .as_deref()
            .map(parse_ts)
            .transpose()
            .map_err(|e| format!("{:#}", e))?;
        let limit = limit.unwrap_or(50).min(MESSAGE_FETCH_CAP) as i64;

        handle.messages(limit, after).await.map_err(|e| e.to_string())
    }

    async fn rpc_session_messages(
        &self,
        session_id: String,
        limit: Option<u32>,
        after: Option<String>,
    ) -> Result<Value, String> {
        self.owned_session(&session_id).await?;
        let messages = self.fetch_session_messages(&session_id, limit, after).await?;
        Ok(json!({ "messages": messages }))
    }

    async fn rpc_forward_messages(
        &mut self,
        session_id: String,
        limit: Option<u32>,
        after: Option<String>,
    ) -> Result<Value, String> {
        let source = self.owned_session(&session_id).await?;
        let messages = self.fetch_session_messages(&session_id, limit, after).await?;

        // Forwarded copies always render as assistant output; provenance
        // lives in the parts blob.
        let mut forwarded = 0usize;
        for original in &messages {
            let mut copy = TranscriptMessage::bare(
                Uuid::new_v4().to_string(),
                Role::Assistant,
                original.content.clone(),
            );
            copy.parts = Some(MessageParts::Forwarded {
                source_session_id: session_id.clone(),
                source_title: source.title.clone(),
                original_role: original.role,
                original_created_at: original.created_at,
            });
            self.store
                .insert_message(&copy)
                .await
                .map_err(|e| format!("{:#}", e))?;
            self.broadcast(ClientEvent::Message { message: copy });
            forwarded += 1;
        }

        Ok(json!({ "forwarded": forwarded }))
    }

    async fn rpc_terminate_child(&self, session_id: String) -> Result<Value, String> {
        let row = self.owned_session(&session_id).await?;
        if row.parent_session_id.as_deref() != Some(self.id.as_str()) {
            return Err(format!("session {} is not a child of this session", session_id));
        }

        let handle = self
            .registry
            .get(&session_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("session {} is not reachable", session_id))?;
        handle
            .stop(StopReason::UserStopped)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "terminated": session_id }))
    }

    async fn rpc_get_session_status(&self, session_id: String) -> Result<Value, String> {
        let row = self.owned_session(&session_id).await?;
        let recent = self
            .fetch_session_messages(&session_id, Some(10), None)
            .await
            .unwrap_or_default();
        Ok(json!({ "session": row, "recentMessages": recent }))
    }

    async fn rpc_list_child_sessions(&self) -> Result<Value, String> {
        let children = self
            .deps
            .directory
            .children_of(&self.id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "sessions": children }))
    }

    // ========================================================================
    // Directory-backed RPCs
    // ========================================================================

    async fn rpc_memory_read(
        &self,
        query: Option<String>,
        limit: Option<u32>,
    ) -> Result<Value, String> {
        let owner = self.owner_id().await.map_err(|e| e.to_string())?;
        let rows = self
            .deps
            .directory
            .memory_read(&owner, query.as_deref(), limit.unwrap_or(20))
            .await
            .map_err(|e| e.to_string())?;

        // Reads boost relevance off the hot path.
        for row in &rows {
            let directory = self.deps.directory.clone();
            let owner = owner.clone();
            let id = row.id.clone();
            tokio::spawn(async move {
                let _ = directory.boost_memory(&owner, &id).await;
            });
        }

        Ok(json!({ "memories": rows }))
    }

    async fn rpc_memory_write(&self, content: String, tags: Vec<String>) -> Result<Value, String> {
        let owner = self.owner_id().await.map_err(|e| e.to_string())?;
        let row = self
            .deps
            .directory
            .memory_write(&owner, &content, &tags)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "memory": row }))
    }

    async fn rpc_memory_delete(&self, id: String) -> Result<Value, String> {
        let owner = self.owner_id().await.map_err(|e| e.to_string())?;
        let deleted = self
            .deps
            .directory
            .memory_delete(&owner, &id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "deleted": deleted }))
    }

    async fn rpc_list_repos(&self, source: Option<String>) -> Result<Value, String> {
        if source.as_deref() == Some("github") {
            let token = self.resolve_git_token().await?;
            return self
                .deps
                .git
                .list_repos(&token, 100)
                .await
                .map_err(|e| format!("{:#}", e));
        }

        let repos = self
            .deps
            .directory
            .org_repos()
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "repositories": repos }))
    }

    async fn rpc_list_personas(&self) -> Result<Value, String> {
        let personas = self
            .deps
            .directory
            .personas()
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "personas": personas }))
    }
}

/// A fresh shared secret for a child session's runner.
fn mint_runner_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_runner_token() {
        let a = mint_runner_token();
        let b = mint_runner_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
