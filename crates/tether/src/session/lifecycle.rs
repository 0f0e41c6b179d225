//! Lifecycle controller.
//!
//! Drives the sandbox through create → run → hibernate → restore → terminate.
//! Provisioner calls run in spawned tasks and post completion events back to
//! the worker loop; every completion handler re-checks the current status
//! before transitioning, because a `stop` (or anything else) may have landed
//! while the call was in flight.
//!
//! Hibernation ordering is load-bearing: snapshot first, runner socket close
//! second. Closing the runner first makes the sandbox exit and the snapshot
//! fail.

use chrono::Utc;
use log::{info, warn};

use tether_protocol::ClientEvent;

use super::agent::{AgentError, AgentEvent, SessionAgent};
use super::models::{SessionStatus, SpawnRequest, StartRequest, StatusSnapshot, StopReason};
use super::store::{format_ts, keys, parse_ts};
use crate::directory::{AuditSinkEntry, DirectorySession};
use crate::sandbox::{SandboxInfo, SnapshotOutcome};

impl SessionAgent {
    // ========================================================================
    // Start
    // ========================================================================

    pub(crate) async fn handle_start(
        &mut self,
        req: StartRequest,
    ) -> Result<StatusSnapshot, AgentError> {
        if self.current_status().await?.is_some() {
            // Start is idempotent; a second call observes the session as-is.
            return self.snapshot().await;
        }

        let store = self.store.clone();
        store.set_state(keys::SESSION_ID, &self.id).await?;
        store.set_state(keys::USER_ID, &req.user_id).await?;
        store.set_state(keys::WORKSPACE, &req.workspace).await?;
        store.set_state(keys::RUNNER_TOKEN, &req.runner_token).await?;
        store
            .set_state(keys::LAST_ACTIVITY_AT, &format_ts(Utc::now()))
            .await?;

        if let Some(url) = &req.backend_url {
            store.set_state(keys::BACKEND_URL, url).await?;
        }
        if let Some(url) = &req.terminate_url {
            store.set_state(keys::TERMINATE_URL, url).await?;
        }
        if let Some(url) = &req.hibernate_url {
            store.set_state(keys::HIBERNATE_URL, url).await?;
        }
        if let Some(url) = &req.restore_url {
            store.set_state(keys::RESTORE_URL, url).await?;
        }
        if let Some(timeout) = req.idle_timeout_ms {
            store
                .set_state(keys::IDLE_TIMEOUT_MS, &timeout.to_string())
                .await?;
        }
        if let Some(spawn_request) = &req.spawn_request {
            store
                .set_state_json(keys::SPAWN_REQUEST, spawn_request)
                .await?;
        }
        if let Some(prompt) = &req.initial_prompt {
            store.set_state(keys::INITIAL_PROMPT, prompt).await?;
        }
        if let Some(model) = &req.initial_model {
            store.set_state(keys::INITIAL_MODEL, model).await?;
        }

        self.set_status(SessionStatus::Initializing)
            .await
            .map_err(AgentError::from)?;

        // The directory row may already exist (child spawn inserts it with
        // the parent pointer before dispatching start).
        match self.deps.directory.get_session(&self.id).await {
            Ok(Some(_)) => {
                if let Err(e) = self
                    .deps
                    .directory
                    .update_session_status(&self.id, "initializing")
                    .await
                {
                    warn!("session {}: directory status update failed: {}", self.id, e);
                }
            }
            Ok(None) => {
                let now = Utc::now();
                if let Err(e) = self
                    .deps
                    .directory
                    .upsert_session(DirectorySession {
                        id: self.id.clone(),
                        user_id: req.user_id.clone(),
                        workspace: req.workspace.clone(),
                        status: "initializing".to_string(),
                        title: None,
                        parent_session_id: None,
                        active_seconds: 0,
                        created_at: now,
                        updated_at: now,
                    })
                    .await
                {
                    warn!("session {}: directory insert failed: {}", self.id, e);
                }
            }
            Err(e) => warn!("session {}: directory lookup failed: {}", self.id, e),
        }

        self.deps
            .events
            .publish(
                &self.id,
                "session.started",
                serde_json::json!({ "userId": req.user_id }),
            )
            .await;
        self.audit("session.started", "session started", Some(&req.user_id), None)
            .await;

        // The initial prompt is queued like any other so FIFO order holds
        // against prompts arriving before the runner does.
        if let Some(initial) = &req.initial_prompt {
            self.accept_prompt(
                initial.clone(),
                req.initial_model.clone(),
                false,
                Some(req.user_id.clone()),
            )
            .await?;
        }

        match (req.sandbox_id, req.tunnels) {
            (Some(sandbox_id), tunnels) => {
                self.enter_running(SandboxInfo {
                    sandbox_id,
                    tunnels: tunnels.unwrap_or_default(),
                })
                .await
                .map_err(AgentError::from)?;
            }
            (None, _) => {
                let backend_url = self.store.get_state(keys::BACKEND_URL).await?;
                let spawn_request = self
                    .store
                    .get_state_json::<SpawnRequest>(keys::SPAWN_REQUEST)
                    .await?;
                match (backend_url, spawn_request) {
                    (Some(url), Some(request)) => self.spawn_sandbox(url, request),
                    _ => {
                        self.fail_session(
                            "start carried neither sandbox info nor a provisioner endpoint",
                        )
                        .await
                        .map_err(AgentError::from)?;
                    }
                }
            }
        }

        self.snapshot().await
    }

    fn spawn_sandbox(&self, url: String, request: SpawnRequest) {
        let provisioner = self.deps.provisioner.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = provisioner
                .spawn(&url, &request)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(AgentEvent::SpawnDone(result));
        });
    }

    pub(crate) async fn on_spawn_done(
        &mut self,
        result: Result<SandboxInfo, String>,
    ) -> anyhow::Result<()> {
        if self.current_status().await.ok().flatten() != Some(SessionStatus::Initializing) {
            warn!("session {}: discarding spawn result after status change", self.id);
            return Ok(());
        }
        match result {
            Ok(info) => self.enter_running(info).await,
            Err(e) => self.fail_session(&format!("provisioner spawn failed: {}", e)).await,
        }
    }

    /// Common landing for `initializing → running` and `restoring → running`.
    pub(crate) async fn enter_running(&mut self, info: SandboxInfo) -> anyhow::Result<()> {
        self.store.set_state(keys::SANDBOX_ID, &info.sandbox_id).await?;
        self.store.set_state_json(keys::TUNNELS, &info.tunnels).await?;
        self.store.delete_state(keys::SNAPSHOT_ID).await?;
        self.store
            .set_state(keys::RUNNING_SINCE, &format_ts(Utc::now()))
            .await?;
        self.store
            .set_state(keys::LAST_ACTIVITY_AT, &format_ts(Utc::now()))
            .await?;
        self.set_status(SessionStatus::Running).await?;
        self.reschedule_alarm().await?;
        info!("session {}: running on sandbox {}", self.id, info.sandbox_id);
        Ok(())
    }

    // ========================================================================
    // Hibernate / wake
    // ========================================================================

    pub(crate) async fn handle_hibernate(&mut self) -> Result<StatusSnapshot, AgentError> {
        let status = self.current_status().await?.ok_or(AgentError::NotStarted)?;
        match status {
            SessionStatus::Hibernated | SessionStatus::Hibernating => self.snapshot().await,
            SessionStatus::Running => {
                self.begin_hibernate().await.map_err(AgentError::from)?;
                self.snapshot().await
            }
            other => Err(AgentError::Conflict(format!(
                "cannot hibernate a session that is {}",
                other
            ))),
        }
    }

    pub(crate) async fn begin_hibernate(&mut self) -> anyhow::Result<()> {
        if self.current_status().await.ok().flatten() != Some(SessionStatus::Running) {
            return Ok(());
        }

        let sandbox_id = self.store.get_state(keys::SANDBOX_ID).await?;
        let hibernate_url = self.store.get_state(keys::HIBERNATE_URL).await?;
        let (Some(sandbox_id), Some(hibernate_url)) = (sandbox_id, hibernate_url) else {
            return self
                .fail_session("cannot hibernate: missing sandbox or hibernate endpoint")
                .await;
        };

        self.flush_active_seconds(true).await;
        self.set_status(SessionStatus::Hibernating).await?;

        // Snapshot first; the runner socket stays open until it returns.
        let provisioner = self.deps.provisioner.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = provisioner
                .snapshot(&hibernate_url, &sandbox_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(AgentEvent::SnapshotDone(result));
        });
        Ok(())
    }

    pub(crate) async fn on_snapshot_done(
        &mut self,
        result: Result<SnapshotOutcome, String>,
    ) -> anyhow::Result<()> {
        if self.current_status().await.ok().flatten() != Some(SessionStatus::Hibernating) {
            warn!("session {}: discarding snapshot result after status change", self.id);
            return Ok(());
        }

        match result {
            Ok(SnapshotOutcome::Snapshot(snapshot_id)) => {
                self.store.set_state(keys::SNAPSHOT_ID, &snapshot_id).await?;
                self.close_runner();
                self.store.delete_state(keys::SANDBOX_ID).await?;
                self.store.delete_state(keys::TUNNELS).await?;
                self.set_status(SessionStatus::Hibernated).await?;
                self.deps
                    .events
                    .publish(
                        &self.id,
                        "session.hibernated",
                        serde_json::json!({ "snapshotId": snapshot_id }),
                    )
                    .await;
                self.audit("session.hibernated", "session hibernated", None, None)
                    .await;
                self.reschedule_alarm().await?;
                info!("session {}: hibernated as {}", self.id, snapshot_id);
            }
            Ok(SnapshotOutcome::Gone) => {
                // The sandbox already exited; that is a clean terminal state,
                // not a failure.
                self.close_runner();
                self.store.delete_state(keys::SANDBOX_ID).await?;
                self.store.delete_state(keys::TUNNELS).await?;
                self.set_status(SessionStatus::Terminated).await?;
                self.alarm.disarm();
                self.deps
                    .events
                    .publish(
                        &self.id,
                        "session.stopped",
                        serde_json::json!({ "reason": "sandbox_exited" }),
                    )
                    .await;
                info!("session {}: sandbox already gone, terminated", self.id);
            }
            Err(e) => {
                self.fail_session(&format!("snapshot failed: {}", e)).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_wake(&mut self) -> Result<StatusSnapshot, AgentError> {
        let status = self.current_status().await?.ok_or(AgentError::NotStarted)?;
        match status {
            SessionStatus::Running | SessionStatus::Restoring => self.snapshot().await,
            SessionStatus::Hibernated => {
                self.begin_wake().await.map_err(AgentError::from)?;
                self.snapshot().await
            }
            other => Err(AgentError::Conflict(format!(
                "cannot wake a session that is {}",
                other
            ))),
        }
    }

    pub(crate) async fn begin_wake(&mut self) -> anyhow::Result<()> {
        if self.current_status().await.ok().flatten() != Some(SessionStatus::Hibernated) {
            return Ok(());
        }

        let snapshot_id = self.store.get_state(keys::SNAPSHOT_ID).await?;
        let restore_url = self.store.get_state(keys::RESTORE_URL).await?;
        let spawn_request = self
            .store
            .get_state_json::<SpawnRequest>(keys::SPAWN_REQUEST)
            .await?;

        let (Some(snapshot_id), Some(restore_url), Some(spawn_request)) =
            (snapshot_id, restore_url, spawn_request)
        else {
            return self
                .fail_session("cannot restore: missing snapshot or spawn request")
                .await;
        };

        self.set_status(SessionStatus::Restoring).await?;

        let provisioner = self.deps.provisioner.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = provisioner
                .restore(&restore_url, &snapshot_id, &spawn_request)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(AgentEvent::RestoreDone(result));
        });
        Ok(())
    }

    pub(crate) async fn on_restore_done(
        &mut self,
        result: Result<SandboxInfo, String>,
    ) -> anyhow::Result<()> {
        if self.current_status().await.ok().flatten() != Some(SessionStatus::Restoring) {
            warn!("session {}: discarding restore result after status change", self.id);
            return Ok(());
        }
        match result {
            Ok(info) => self.enter_running(info).await,
            Err(e) => self.fail_session(&format!("restore failed: {}", e)).await,
        }
    }

    // ========================================================================
    // Stop
    // ========================================================================

    pub(crate) async fn handle_stop(
        &mut self,
        reason: StopReason,
    ) -> Result<StatusSnapshot, AgentError> {
        let status = self.current_status().await?.ok_or(AgentError::NotStarted)?;
        if status.is_terminal() {
            // Stop on a terminated (or errored) session is a no-op returning
            // success.
            return self.snapshot().await;
        }

        if status == SessionStatus::Running {
            self.flush_active_seconds(true).await;
        }

        self.send_runner(tether_protocol::RunnerCommand::Stop);
        self.close_runner();

        let sandbox_id = self.store.get_state(keys::SANDBOX_ID).await?;
        let terminate_url = self.store.get_state(keys::TERMINATE_URL).await?;
        if let (Some(sandbox_id), Some(terminate_url)) = (sandbox_id, terminate_url) {
            let provisioner = self.deps.provisioner.clone();
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = provisioner
                    .terminate(&terminate_url, &sandbox_id)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx.send(AgentEvent::TerminateDone(result));
            });
        }

        self.set_status(SessionStatus::Terminated)
            .await
            .map_err(AgentError::from)?;
        self.alarm.disarm();

        self.deps
            .events
            .publish(
                &self.id,
                "session.stopped",
                serde_json::json!({ "reason": reason.as_str() }),
            )
            .await;
        self.audit("session.stopped", "session stopped", None, None).await;
        self.flush_metrics().await;

        self.cascade_stop_to_children().await;

        info!("session {}: terminated ({})", self.id, reason.as_str());
        self.snapshot().await
    }

    /// Best-effort stop of every non-terminated child in the directory.
    fn cascade_stop_to_children(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let children = match self.deps.directory.children_of(&self.id).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("session {}: child lookup failed during stop: {}", self.id, e);
                    return;
                }
            };

            for child in children {
                if child.status == "terminated" || child.status == "error" {
                    continue;
                }
                let registry = self.registry.clone();
                let child_id = child.id.clone();
                tokio::spawn(async move {
                    match registry.get(&child_id).await {
                        Ok(Some(handle)) => {
                            if let Err(e) = handle.stop(StopReason::UserStopped).await {
                                warn!("cascade stop of child {} failed: {}", child_id, e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("cascade stop of child {} failed: {}", child_id, e),
                    }
                });
            }
        })
    }

    // ========================================================================
    // Metrics and failure
    // ========================================================================

    /// Flush elapsed active seconds to the directory. With `leaving` the
    /// running interval ends; otherwise the timestamp re-anchors so no
    /// interval is double-counted.
    pub(crate) async fn flush_active_seconds(&mut self, leaving: bool) {
        let since = match self.store.get_state(keys::RUNNING_SINCE).await {
            Ok(Some(raw)) => match parse_ts(&raw) {
                Ok(ts) => ts,
                Err(_) => return,
            },
            _ => return,
        };

        let now = Utc::now();
        let elapsed = (now - since).num_seconds().max(0);
        if elapsed > 0 {
            if let Err(e) = self.deps.directory.add_active_seconds(&self.id, elapsed).await {
                warn!("session {}: active-seconds flush failed: {}", self.id, e);
                return;
            }
        }

        let result = if leaving {
            self.store.delete_state(keys::RUNNING_SINCE).await
        } else {
            self.store.set_state(keys::RUNNING_SINCE, &format_ts(now)).await
        };
        if let Err(e) = result {
            warn!("session {}: running-since update failed: {:#}", self.id, e);
        }
    }

    /// Periodic flush: active seconds plus the audit backlog.
    pub(crate) async fn flush_metrics(&mut self) {
        if self.current_status().await.ok().flatten() == Some(SessionStatus::Running) {
            self.flush_active_seconds(false).await;
        }

        let entries = match self.store.unflushed_audit().await {
            Ok(entries) if !entries.is_empty() => entries,
            _ => return,
        };
        let last_seq = entries.last().map(|e| e.seq).unwrap_or(0);
        let sink: Vec<AuditSinkEntry> = entries
            .iter()
            .map(|entry| AuditSinkEntry {
                event: entry.event.clone(),
                summary: entry.summary.clone(),
                actor: entry.actor.clone(),
                metadata: entry
                    .metadata
                    .as_deref()
                    .and_then(|raw| serde_json::from_str(raw).ok()),
                created_at: entry.created_at.clone(),
            })
            .collect();

        match self.deps.directory.append_audit(&self.id, &sink).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_audit_flushed(last_seq).await {
                    warn!("session {}: audit flush bookkeeping failed: {:#}", self.id, e);
                }
            }
            Err(e) => warn!("session {}: audit drain failed: {}", self.id, e),
        }
    }

    /// Irrecoverable failure: error state, system message, error frame,
    /// directory update, external event.
    pub(crate) async fn fail_session(&mut self, message: &str) -> anyhow::Result<()> {
        warn!("session {}: {}", self.id, message);
        self.set_status(SessionStatus::Error).await?;
        self.alarm.disarm();
        self.system_message(&format!("Error: {}", message)).await?;
        self.broadcast(ClientEvent::Error {
            message: message.to_string(),
        });
        self.deps
            .events
            .publish(
                &self.id,
                "session.errored",
                serde_json::json!({ "message": message }),
            )
            .await;
        Ok(())
    }
}
