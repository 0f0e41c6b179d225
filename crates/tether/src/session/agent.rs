//! The per-session single-writer agent.
//!
//! Every inbound frame, control call, alarm, and provisioner completion is an
//! [`AgentEvent`] on one unbounded channel; a single worker task owns the
//! store and all connection state and processes events strictly in order.
//! External calls that must not block the loop (provisioner spawn, snapshot,
//! restore, terminate) run in spawned tasks that post completion events back
//! onto the same channel, and their handlers re-check the lifecycle status
//! rather than trusting the state from when the call started.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use tether_protocol::{
    ClientEvent, ClientMessage, ConnectedUser, QuestionFrame, RunnerCommand, RunnerMessage,
};

use super::models::{SessionStatus, StartRequest, StatusSnapshot, StopReason, TunnelUrls};
use super::registry::{SessionDeps, SessionRegistry};
use super::scheduler::Alarm;
use super::store::{SessionStore, keys};
use crate::directory::GitStatePatch;
use crate::sandbox::{SandboxInfo, SnapshotOutcome};

/// Errors surfaced to callers of a [`SessionHandle`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session not started")]
    NotStarted,

    #[error("invalid runner token")]
    InvalidToken,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("session agent is gone")]
    Closed,
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}

type Reply<T> = oneshot::Sender<Result<T, AgentError>>;

/// Everything the worker loop reacts to.
pub(crate) enum AgentEvent {
    ClientConnect {
        user_id: String,
        tx: mpsc::UnboundedSender<ClientEvent>,
        reply: Reply<u64>,
    },
    ClientFrame {
        conn_id: u64,
        frame: ClientMessage,
    },
    ClientDisconnect {
        conn_id: u64,
    },
    RunnerConnect {
        token: String,
        tx: mpsc::UnboundedSender<RunnerCommand>,
        reply: Reply<u64>,
    },
    RunnerFrame {
        conn_id: u64,
        frame: RunnerMessage,
    },
    RunnerDisconnect {
        conn_id: u64,
    },
    Start {
        req: Box<StartRequest>,
        reply: Reply<StatusSnapshot>,
    },
    Stop {
        reason: StopReason,
        reply: Reply<StatusSnapshot>,
    },
    Status {
        reply: Reply<StatusSnapshot>,
    },
    Hibernate {
        reply: Reply<StatusSnapshot>,
    },
    Wake {
        reply: Reply<StatusSnapshot>,
    },
    ClearQueue {
        reply: Reply<u64>,
    },
    Prompt {
        content: String,
        model: Option<String>,
        interrupt: bool,
        user_id: Option<String>,
        reply: Reply<String>,
    },
    Answer {
        question_id: String,
        answer: String,
        reply: Reply<bool>,
    },
    Messages {
        limit: i64,
        after: Option<DateTime<Utc>>,
        reply: Reply<Vec<tether_protocol::TranscriptMessage>>,
    },
    FlushMetrics {
        reply: Reply<()>,
    },
    WebhookUpdate {
        patch: GitStatePatch,
        reply: Reply<()>,
    },
    Gc {
        reply: Reply<()>,
    },
    AlarmFired,
    SpawnDone(Result<SandboxInfo, String>),
    SnapshotDone(Result<SnapshotOutcome, String>),
    RestoreDone(Result<SandboxInfo, String>),
    TerminateDone(Result<(), String>),
}

/// Cheap clonable sender into a session's worker loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> AgentEvent,
    ) -> Result<T, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).map_err(|_| AgentError::Closed)?;
        rx.await.map_err(|_| AgentError::Closed)?
    }

    pub async fn start(&self, req: StartRequest) -> Result<StatusSnapshot, AgentError> {
        self.request(|reply| AgentEvent::Start {
            req: Box::new(req),
            reply,
        })
        .await
    }

    pub async fn stop(&self, reason: StopReason) -> Result<StatusSnapshot, AgentError> {
        self.request(|reply| AgentEvent::Stop { reason, reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, AgentError> {
        self.request(|reply| AgentEvent::Status { reply }).await
    }

    pub async fn hibernate(&self) -> Result<StatusSnapshot, AgentError> {
        self.request(|reply| AgentEvent::Hibernate { reply }).await
    }

    pub async fn wake(&self) -> Result<StatusSnapshot, AgentError> {
        self.request(|reply| AgentEvent::Wake { reply }).await
    }

    pub async fn clear_queue(&self) -> Result<u64, AgentError> {
        self.request(|reply| AgentEvent::ClearQueue { reply }).await
    }

    pub async fn prompt(
        &self,
        content: String,
        model: Option<String>,
        interrupt: bool,
        user_id: Option<String>,
    ) -> Result<String, AgentError> {
        self.request(|reply| AgentEvent::Prompt {
            content,
            model,
            interrupt,
            user_id,
            reply,
        })
        .await
    }

    pub async fn messages(
        &self,
        limit: i64,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<tether_protocol::TranscriptMessage>, AgentError> {
        self.request(|reply| AgentEvent::Messages { limit, after, reply })
            .await
    }

    /// Answer a pending question. Returns false when the question was already
    /// answered or expired (a no-op).
    pub async fn answer(&self, question_id: String, answer: String) -> Result<bool, AgentError> {
        self.request(|reply| AgentEvent::Answer {
            question_id,
            answer,
            reply,
        })
        .await
    }

    pub async fn flush_metrics(&self) -> Result<(), AgentError> {
        self.request(|reply| AgentEvent::FlushMetrics { reply }).await
    }

    pub async fn webhook_update(&self, patch: GitStatePatch) -> Result<(), AgentError> {
        self.request(|reply| AgentEvent::WebhookUpdate { patch, reply })
            .await
    }

    pub async fn gc(&self) -> Result<(), AgentError> {
        self.request(|reply| AgentEvent::Gc { reply }).await
    }

    /// Attach a client connection; returns the connection id and the stream
    /// of outbound frames for it.
    pub async fn connect_client(
        &self,
        user_id: String,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ClientEvent>), AgentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self
            .request(|reply| AgentEvent::ClientConnect { user_id, tx, reply })
            .await?;
        Ok((conn_id, rx))
    }

    pub fn client_frame(&self, conn_id: u64, frame: ClientMessage) {
        let _ = self.tx.send(AgentEvent::ClientFrame { conn_id, frame });
    }

    pub fn disconnect_client(&self, conn_id: u64) {
        let _ = self.tx.send(AgentEvent::ClientDisconnect { conn_id });
    }

    /// Attach the runner connection. Fails on a bad shared secret; an
    /// existing runner connection is replaced (its stream ends).
    pub async fn connect_runner(
        &self,
        token: String,
    ) -> Result<(u64, mpsc::UnboundedReceiver<RunnerCommand>), AgentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self
            .request(|reply| AgentEvent::RunnerConnect { token, tx, reply })
            .await?;
        Ok((conn_id, rx))
    }

    pub fn runner_frame(&self, conn_id: u64, frame: RunnerMessage) {
        let _ = self.tx.send(AgentEvent::RunnerFrame { conn_id, frame });
    }

    pub fn disconnect_runner(&self, conn_id: u64) {
        let _ = self.tx.send(AgentEvent::RunnerDisconnect { conn_id });
    }
}

pub(crate) struct ClientConn {
    pub(crate) user: ConnectedUser,
    pub(crate) tx: mpsc::UnboundedSender<ClientEvent>,
}

pub(crate) struct RunnerConn {
    pub(crate) conn_id: u64,
    pub(crate) tx: mpsc::UnboundedSender<RunnerCommand>,
}

/// The worker owning one session.
pub(crate) struct SessionAgent {
    pub(crate) id: String,
    pub(crate) store: SessionStore,
    pub(crate) deps: Arc<SessionDeps>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) clients: HashMap<u64, ClientConn>,
    pub(crate) runner: Option<RunnerConn>,
    pub(crate) alarm: Alarm,
    pub(crate) self_tx: mpsc::UnboundedSender<AgentEvent>,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    next_conn_id: u64,
}

impl SessionAgent {
    /// Create the agent and its handle; the caller spawns [`Self::run`].
    pub(crate) fn new(
        id: String,
        store: SessionStore,
        deps: Arc<SessionDeps>,
        registry: Arc<SessionRegistry>,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            session_id: id.clone(),
            tx: tx.clone(),
        };
        let agent = Self {
            id,
            store,
            deps,
            registry,
            clients: HashMap::new(),
            runner: None,
            alarm: Alarm::new(),
            self_tx: tx,
            rx,
            next_conn_id: 1,
        };
        (agent, handle)
    }

    pub(crate) async fn run(mut self) {
        debug!("session {} agent loop started", self.id);
        while let Some(event) = self.rx.recv().await {
            if self.handle_event(event).await {
                break;
            }
        }
        self.alarm.disarm();
        self.store.close().await;
        debug!("session {} agent loop finished", self.id);
    }

    /// Returns true when the loop should exit (gc).
    async fn handle_event(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::ClientConnect { user_id, tx, reply } => {
                let result = self.on_client_connect(user_id, tx).await;
                let _ = reply.send(result);
            }
            AgentEvent::ClientFrame { conn_id, frame } => {
                if let Err(e) = self.on_client_frame(conn_id, frame).await {
                    warn!("session {}: client frame failed: {:#}", self.id, e);
                    self.send_to(
                        conn_id,
                        ClientEvent::Error {
                            message: format!("{:#}", e),
                        },
                    );
                }
            }
            AgentEvent::ClientDisconnect { conn_id } => {
                if let Err(e) = self.on_client_disconnect(conn_id).await {
                    warn!("session {}: client disconnect failed: {:#}", self.id, e);
                }
            }
            AgentEvent::RunnerConnect { token, tx, reply } => {
                let result = self.on_runner_connect(token, tx).await;
                let _ = reply.send(result);
            }
            AgentEvent::RunnerFrame { conn_id, frame } => {
                let current = self.runner.as_ref().map(|r| r.conn_id);
                if current != Some(conn_id) {
                    debug!("session {}: dropping frame from stale runner", self.id);
                } else if let Err(e) = self.on_runner_frame(frame).await {
                    warn!("session {}: runner frame failed: {:#}", self.id, e);
                }
            }
            AgentEvent::RunnerDisconnect { conn_id } => {
                if let Err(e) = self.on_runner_disconnect(conn_id).await {
                    warn!("session {}: runner disconnect failed: {:#}", self.id, e);
                }
            }
            AgentEvent::Start { req, reply } => {
                let result = self.handle_start(*req).await;
                let _ = reply.send(result);
            }
            AgentEvent::Stop { reason, reply } => {
                let result = self.handle_stop(reason).await;
                let _ = reply.send(result);
            }
            AgentEvent::Status { reply } => {
                let result = self.snapshot().await;
                let _ = reply.send(result);
            }
            AgentEvent::Hibernate { reply } => {
                let result = self.handle_hibernate().await;
                let _ = reply.send(result);
            }
            AgentEvent::Wake { reply } => {
                let result = self.handle_wake().await;
                let _ = reply.send(result);
            }
            AgentEvent::ClearQueue { reply } => {
                let result = self.store.clear_queued().await.map_err(AgentError::from);
                let _ = reply.send(result);
            }
            AgentEvent::Prompt {
                content,
                model,
                interrupt,
                user_id,
                reply,
            } => {
                let result = self
                    .accept_prompt(content, model, interrupt, user_id)
                    .await;
                let _ = reply.send(result);
            }
            AgentEvent::Answer {
                question_id,
                answer,
                reply,
            } => {
                let result = self.record_answer(question_id, answer).await;
                let _ = reply.send(result);
            }
            AgentEvent::Messages { limit, after, reply } => {
                let result = self
                    .store
                    .list_messages(limit, after)
                    .await
                    .map_err(AgentError::from);
                let _ = reply.send(result);
            }
            AgentEvent::FlushMetrics { reply } => {
                self.flush_metrics().await;
                let _ = reply.send(Ok(()));
            }
            AgentEvent::WebhookUpdate { patch, reply } => {
                let result = self.on_webhook_update(patch).await;
                let _ = reply.send(result);
            }
            AgentEvent::Gc { reply } => {
                let result = self.handle_gc().await;
                let _ = reply.send(result);
                return true;
            }
            AgentEvent::AlarmFired => {
                if let Err(e) = self.on_alarm().await {
                    warn!("session {}: alarm handling failed: {:#}", self.id, e);
                }
            }
            AgentEvent::SpawnDone(result) => {
                if let Err(e) = self.on_spawn_done(result).await {
                    warn!("session {}: spawn completion failed: {:#}", self.id, e);
                }
            }
            AgentEvent::SnapshotDone(result) => {
                if let Err(e) = self.on_snapshot_done(result).await {
                    warn!("session {}: snapshot completion failed: {:#}", self.id, e);
                }
            }
            AgentEvent::RestoreDone(result) => {
                if let Err(e) = self.on_restore_done(result).await {
                    warn!("session {}: restore completion failed: {:#}", self.id, e);
                }
            }
            AgentEvent::TerminateDone(result) => {
                if let Err(e) = result {
                    warn!("session {}: sandbox terminate failed: {}", self.id, e);
                }
            }
        }
        false
    }

    // ========================================================================
    // Connections
    // ========================================================================

    async fn on_client_connect(
        &mut self,
        user_id: String,
        tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<u64, AgentError> {
        let Some(status) = self.current_status().await? else {
            return Err(AgentError::NotStarted);
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let first_connection = self.store.user_connected(&user_id).await?;
        let user = self.resolve_user(&user_id).await;
        self.clients.insert(
            conn_id,
            ClientConn {
                user: user.clone(),
                tx: tx.clone(),
            },
        );

        let init = self.build_init(status).await?;
        let _ = tx.send(init);

        for question in self.store.pending_questions().await? {
            let _ = tx.send(ClientEvent::Question {
                question: QuestionFrame {
                    id: question.id.clone(),
                    text: question.text.clone(),
                    options: question.options_vec(),
                    expires_at: super::store::parse_ts(&question.expires_at)
                        .map_err(AgentError::from)?,
                },
            });
        }

        if first_connection {
            self.broadcast_except(conn_id, ClientEvent::UserJoined { user: user.clone() });
            self.deps
                .events
                .publish(
                    &self.id,
                    "user.joined",
                    serde_json::json!({ "userId": user.id }),
                )
                .await;
        }

        info!("session {}: client {} connected (#{})", self.id, user_id, conn_id);
        Ok(conn_id)
    }

    async fn on_client_disconnect(&mut self, conn_id: u64) -> anyhow::Result<()> {
        let Some(conn) = self.clients.remove(&conn_id) else {
            return Ok(());
        };

        let last_connection = self.store.user_disconnected(&conn.user.id).await?;
        if last_connection {
            self.broadcast(ClientEvent::UserLeft {
                user_id: conn.user.id.clone(),
            });
            self.deps
                .events
                .publish(
                    &self.id,
                    "user.left",
                    serde_json::json!({ "userId": conn.user.id }),
                )
                .await;
        }

        info!("session {}: client connection #{} closed", self.id, conn_id);
        Ok(())
    }

    async fn on_runner_connect(
        &mut self,
        token: String,
        tx: mpsc::UnboundedSender<RunnerCommand>,
    ) -> Result<u64, AgentError> {
        let expected = self
            .store
            .get_state(keys::RUNNER_TOKEN)
            .await
            .map_err(AgentError::from)?
            .ok_or(AgentError::NotStarted)?;
        if token != expected {
            return Err(AgentError::InvalidToken);
        }

        // Only one runner connection; a newcomer displaces the old one.
        if let Some(old) = self.runner.take() {
            info!("session {}: replacing runner connection #{}", self.id, old.conn_id);
            drop(old);
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.runner = Some(RunnerConn { conn_id, tx });

        self.broadcast(ClientEvent::Status {
            lifecycle: None,
            runner_connected: Some(true),
            question_expired: None,
        });

        // A prompt may already be waiting (queued while disconnected, or the
        // initial prompt recorded at start).
        if self.store.processing_entry().await.map_err(AgentError::from)?.is_none() {
            if let Some(next) = self.store.next_queued().await.map_err(AgentError::from)? {
                self.dispatch_prompt(next).await.map_err(AgentError::from)?;
            }
        }

        info!("session {}: runner connected (#{})", self.id, conn_id);
        Ok(conn_id)
    }

    async fn on_runner_disconnect(&mut self, conn_id: u64) -> anyhow::Result<()> {
        let Some(current) = &self.runner else {
            return Ok(());
        };
        if current.conn_id != conn_id {
            return Ok(());
        }

        self.runner = None;
        // A prompt caught mid-turn goes back to the queue and is re-sent when
        // the runner returns.
        let requeued = self.store.requeue_processing().await?;
        if requeued > 0 {
            debug!("session {}: requeued in-flight prompt on runner loss", self.id);
        }
        self.store.set_state_bool(keys::RUNNER_BUSY, false).await?;

        self.broadcast(ClientEvent::Status {
            lifecycle: None,
            runner_connected: Some(false),
            question_expired: None,
        });

        // The busy flag just cleared; the idle deadline may arm again.
        self.reschedule_alarm().await?;

        info!("session {}: runner disconnected (#{})", self.id, conn_id);
        Ok(())
    }

    // ========================================================================
    // Client frames
    // ========================================================================

    async fn on_client_frame(&mut self, conn_id: u64, frame: ClientMessage) -> anyhow::Result<()> {
        match frame {
            ClientMessage::Prompt { content, model } => {
                let user_id = self.clients.get(&conn_id).map(|c| c.user.id.clone());
                self.accept_prompt(content, model, false, user_id)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            }
            ClientMessage::Answer {
                question_id,
                answer,
            } => {
                self.record_answer(question_id, answer)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            }
            ClientMessage::Ping => {
                self.send_to(conn_id, ClientEvent::Pong);
            }
            ClientMessage::Abort => {
                self.abort_turn().await?;
            }
            ClientMessage::Revert { message_id } => {
                self.revert_to(&message_id).await?;
            }
            ClientMessage::Diff { request_id } => {
                if !self.send_runner(RunnerCommand::Diff { request_id }) {
                    self.send_to(
                        conn_id,
                        ClientEvent::Error {
                            message: "runner not connected".to_string(),
                        },
                    );
                }
            }
            ClientMessage::Review { request_id } => {
                if !self.send_runner(RunnerCommand::Review { request_id }) {
                    self.send_to(
                        conn_id,
                        ClientEvent::Error {
                            message: "runner not connected".to_string(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Record a question answer and forward it to the runner. Answering an
    /// answered or expired question is a no-op.
    async fn record_answer(
        &mut self,
        question_id: String,
        answer: String,
    ) -> Result<bool, AgentError> {
        let landed = self
            .store
            .answer_question(&question_id, &answer)
            .await
            .map_err(AgentError::from)?;
        if landed {
            self.send_runner(RunnerCommand::Answer {
                question_id,
                answer,
            });
        }
        Ok(landed)
    }

    async fn on_webhook_update(&mut self, patch: GitStatePatch) -> Result<(), AgentError> {
        if self.current_status().await?.is_none() {
            return Err(AgentError::NotStarted);
        }
        if patch.is_empty() {
            return Err(AgentError::BadRequest(
                "webhook update carried no recognised fields".to_string(),
            ));
        }

        if let Err(e) = self
            .deps
            .directory
            .update_git_state(&self.id, patch.clone())
            .await
        {
            warn!("session {}: git-state update failed: {}", self.id, e);
        }

        // Broadcast-only; webhook updates never force lifecycle transitions.
        self.broadcast(ClientEvent::GitState {
            state: serde_json::to_value(&patch).unwrap_or_default(),
        });
        Ok(())
    }

    async fn handle_gc(&mut self) -> Result<(), AgentError> {
        info!("session {}: garbage collecting", self.id);
        self.alarm.disarm();
        self.clients.clear();
        self.runner = None;
        self.store.wipe().await?;
        self.store.close().await;
        Ok(())
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    pub(crate) async fn current_status(&self) -> Result<Option<SessionStatus>, AgentError> {
        let raw = self
            .store
            .get_state(keys::STATUS)
            .await
            .map_err(AgentError::from)?;
        match raw {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e: String| AgentError::Internal(e)),
            None => Ok(None),
        }
    }

    /// Persist a status change, mirror it to the directory, and tell clients.
    pub(crate) async fn set_status(&mut self, status: SessionStatus) -> anyhow::Result<()> {
        self.store
            .set_state(keys::STATUS, &status.to_string())
            .await?;
        if let Err(e) = self
            .deps
            .directory
            .update_session_status(&self.id, &status.to_string())
            .await
        {
            warn!("session {}: directory status update failed: {}", self.id, e);
        }
        self.broadcast(ClientEvent::Status {
            lifecycle: Some(status.to_string()),
            runner_connected: None,
            question_expired: None,
        });
        Ok(())
    }

    pub(crate) async fn owner_id(&self) -> Result<String, AgentError> {
        self.store
            .get_state(keys::USER_ID)
            .await
            .map_err(AgentError::from)?
            .ok_or(AgentError::NotStarted)
    }

    pub(crate) async fn resolve_user(&self, user_id: &str) -> ConnectedUser {
        match self.deps.directory.user_profile(user_id).await {
            Ok(Some(profile)) => ConnectedUser {
                id: profile.id,
                name: profile.name,
                email: profile.email,
                avatar: profile.avatar,
            },
            _ => ConnectedUser {
                id: user_id.to_string(),
                name: None,
                email: None,
                avatar: None,
            },
        }
    }

    async fn build_init(&self, status: SessionStatus) -> Result<ClientEvent, AgentError> {
        let messages = self.store.all_messages().await.map_err(AgentError::from)?;
        let has_sandbox = self
            .store
            .get_state(keys::SANDBOX_ID)
            .await
            .map_err(AgentError::from)?
            .is_some();
        let models = self
            .store
            .get_state_json::<serde_json::Value>(keys::MODELS)
            .await
            .map_err(AgentError::from)?;
        let title = self
            .store
            .get_state(keys::TITLE)
            .await
            .map_err(AgentError::from)?;

        let mut users = Vec::new();
        for user_id in self
            .store
            .connected_user_ids()
            .await
            .map_err(AgentError::from)?
        {
            users.push(self.resolve_user(&user_id).await);
        }

        let audit_log = self
            .store
            .unflushed_audit()
            .await
            .map_err(AgentError::from)?
            .iter()
            .map(|entry| entry.to_wire())
            .collect();

        Ok(ClientEvent::Init {
            messages,
            status: status.to_string(),
            has_sandbox,
            runner_connected: self.runner.is_some(),
            models,
            users,
            audit_log,
            title,
        })
    }

    pub(crate) async fn snapshot(&self) -> Result<StatusSnapshot, AgentError> {
        let status = self.current_status().await?.ok_or(AgentError::NotStarted)?;
        let store = &self.store;

        let running_since = store
            .get_state(keys::RUNNING_SINCE)
            .await
            .map_err(AgentError::from)?
            .map(|raw| super::store::parse_ts(&raw))
            .transpose()
            .map_err(AgentError::from)?;
        let last_activity_at = store
            .get_state(keys::LAST_ACTIVITY_AT)
            .await
            .map_err(AgentError::from)?
            .map(|raw| super::store::parse_ts(&raw))
            .transpose()
            .map_err(AgentError::from)?;

        Ok(StatusSnapshot {
            session_id: self.id.clone(),
            status,
            user_id: store.get_state(keys::USER_ID).await.map_err(AgentError::from)?,
            workspace: store
                .get_state(keys::WORKSPACE)
                .await
                .map_err(AgentError::from)?,
            sandbox_id: store
                .get_state(keys::SANDBOX_ID)
                .await
                .map_err(AgentError::from)?,
            snapshot_id: store
                .get_state(keys::SNAPSHOT_ID)
                .await
                .map_err(AgentError::from)?,
            tunnels: store
                .get_state_json::<TunnelUrls>(keys::TUNNELS)
                .await
                .map_err(AgentError::from)?,
            title: store.get_state(keys::TITLE).await.map_err(AgentError::from)?,
            runner_connected: self.runner.is_some(),
            runner_busy: store
                .get_state_bool(keys::RUNNER_BUSY)
                .await
                .map_err(AgentError::from)?,
            queue_depth: store.queue_depth().await.map_err(AgentError::from)?,
            pending_questions: store
                .pending_question_count()
                .await
                .map_err(AgentError::from)?,
            connected_users: store
                .connected_user_ids()
                .await
                .map_err(AgentError::from)?
                .len() as i64,
            running_since,
            last_activity_at,
        })
    }

    /// Insert a system message and broadcast it.
    pub(crate) async fn system_message(&mut self, content: &str) -> anyhow::Result<()> {
        let msg = tether_protocol::TranscriptMessage::bare(
            uuid::Uuid::new_v4().to_string(),
            tether_protocol::Role::System,
            content,
        );
        self.store.insert_message(&msg).await?;
        self.broadcast(ClientEvent::Message { message: msg });
        Ok(())
    }

    /// Append an audit entry and stream it to connected clients.
    pub(crate) async fn audit(
        &mut self,
        event: &str,
        summary: &str,
        actor: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        match self
            .store
            .append_audit(event, summary, actor, metadata.as_ref())
            .await
        {
            Ok(entry) => self.broadcast(ClientEvent::AuditLog {
                entries: vec![entry.to_wire()],
            }),
            Err(e) => warn!("session {}: audit append failed: {:#}", self.id, e),
        }
    }

    pub(crate) fn broadcast(&self, event: ClientEvent) {
        for conn in self.clients.values() {
            let _ = conn.tx.send(event.clone());
        }
    }

    pub(crate) fn broadcast_except(&self, skip: u64, event: ClientEvent) {
        for (id, conn) in &self.clients {
            if *id != skip {
                let _ = conn.tx.send(event.clone());
            }
        }
    }

    pub(crate) fn send_to(&self, conn_id: u64, event: ClientEvent) {
        if let Some(conn) = self.clients.get(&conn_id) {
            let _ = conn.tx.send(event);
        }
    }

    /// Send a command to the runner; returns false when no runner is
    /// connected (or its channel is gone).
    pub(crate) fn send_runner(&self, cmd: RunnerCommand) -> bool {
        match &self.runner {
            Some(runner) => runner.tx.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Close the runner connection from the session side. The socket task
    /// observes its channel closing and finishes the handshake.
    pub(crate) fn close_runner(&mut self) {
        if let Some(runner) = self.runner.take() {
            debug!("session {}: closing runner connection #{}", self.id, runner.conn_id);
            drop(runner);
        }
    }

    pub(crate) async fn touch_activity(&mut self) -> anyhow::Result<()> {
        self.store
            .set_state(keys::LAST_ACTIVITY_AT, &super::store::format_ts(Utc::now()))
            .await?;
        Ok(())
    }
}
