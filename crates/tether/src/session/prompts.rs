//! Prompt arbiter.
//!
//! FIFO discipline with a single prompt in flight. A prompt is first recorded
//! as a user message (and broadcast), then either dispatched directly or
//! queued; `complete`/`aborted` from the runner drain the queue. Interrupt
//! mode aborts in-flight work and clears the queue before enqueueing itself,
//! then rides the normal `aborted` drain.

use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use tether_protocol::{
    ClientEvent, GitIdentity, PromptAuthor, Role, RunnerCommand, TranscriptMessage,
};

use super::agent::{AgentError, SessionAgent};
use super::models::{PromptStatus, QueueEntry, SessionStatus};
use super::store::{format_ts, keys};

impl SessionAgent {
    /// Accept a prompt from a client frame, the HTTP endpoint, or a sibling
    /// session. Returns the id of the recorded user message.
    pub(crate) async fn accept_prompt(
        &mut self,
        content: String,
        model: Option<String>,
        interrupt: bool,
        user_id: Option<String>,
    ) -> Result<String, AgentError> {
        let status = self.current_status().await?.ok_or(AgentError::NotStarted)?;
        if status.is_terminal() {
            return Err(AgentError::Conflict(format!(
                "cannot prompt a session that is {}",
                status
            )));
        }

        let author_id = match user_id {
            Some(id) => id,
            None => self.owner_id().await?,
        };
        let author = self.resolve_user(&author_id).await;

        let message = TranscriptMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.clone(),
            parts: None,
            author_id: Some(author.id.clone()),
            author_email: author.email.clone(),
            author_name: author.name.clone(),
            author_avatar: author.avatar.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert_message(&message)
            .await
            .map_err(AgentError::from)?;
        self.broadcast(ClientEvent::Message {
            message: message.clone(),
        });
        self.touch_activity().await.map_err(AgentError::from)?;

        let busy = self
            .store
            .get_state_bool(keys::RUNNER_BUSY)
            .await
            .map_err(AgentError::from)?;

        if interrupt && busy {
            // Abort in-flight work and displace everything still queued; the
            // `aborted` acknowledgement drains this prompt.
            let cleared = self.store.clear_queued().await.map_err(AgentError::from)?;
            self.send_runner(RunnerCommand::Abort);
            self.enqueue_message(&message, model).await?;
            info!(
                "session {}: interrupt prompt {} queued ({} displaced)",
                self.id, message.id, cleared
            );
            return Ok(message.id);
        }

        self.enqueue_message(&message, model).await?;

        if status == SessionStatus::Hibernated {
            // Queue and wake; the prompt drains when the runner reconnects
            // after restore.
            self.begin_wake().await.map_err(AgentError::from)?;
            return Ok(message.id);
        }

        let has_processing = self
            .store
            .processing_entry()
            .await
            .map_err(AgentError::from)?
            .is_some();
        if self.runner.is_some() && !busy && !has_processing {
            if let Some(next) = self.store.next_queued().await.map_err(AgentError::from)? {
                self.dispatch_prompt(next).await.map_err(AgentError::from)?;
            }
        }

        Ok(message.id)
    }

    async fn enqueue_message(
        &mut self,
        message: &TranscriptMessage,
        model: Option<String>,
    ) -> Result<(), AgentError> {
        self.store
            .enqueue_prompt(&QueueEntry {
                id: message.id.clone(),
                content: message.content.clone(),
                model,
                status: PromptStatus::Queued,
                author_id: message.author_id.clone(),
                author_email: message.author_email.clone(),
                author_name: message.author_name.clone(),
                created_at: format_ts(message.created_at),
            })
            .await
            .map_err(AgentError::from)
    }

    /// Send one queue entry to the runner, capturing author attribution for
    /// the whole turn.
    pub(crate) async fn dispatch_prompt(&mut self, entry: QueueEntry) -> anyhow::Result<()> {
        let owner = self.owner_id().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let author_id = entry.author_id.clone().unwrap_or_else(|| owner.clone());

        let author = PromptAuthor {
            id: author_id.clone(),
            email: entry.author_email.clone(),
            name: entry.author_name.clone(),
        };

        // Git identity from the author's profile, falling back to their
        // display identity.
        let git_identity = match self.deps.directory.user_profile(&author_id).await {
            Ok(Some(profile)) => GitIdentity {
                name: profile.git_name.or(profile.name),
                email: profile.git_email.or(profile.email),
            },
            _ => GitIdentity::default(),
        };

        let model_preferences = self
            .deps
            .directory
            .model_preferences(&owner)
            .await
            .unwrap_or_default();

        self.store
            .set_prompt_status(&entry.id, PromptStatus::Processing)
            .await?;
        self.store.set_state_bool(keys::RUNNER_BUSY, true).await?;
        self.store
            .set_state_json(keys::CURRENT_AUTHOR, &author)
            .await?;

        let sent = self.send_runner(RunnerCommand::Prompt {
            id: entry.id.clone(),
            content: entry.content.clone(),
            model: entry.model.clone(),
            author,
            git_identity,
            model_preferences,
        });

        if !sent {
            // Runner vanished between the check and the send; put the entry
            // back and wait for the reconnect.
            self.store
                .set_prompt_status(&entry.id, PromptStatus::Queued)
                .await?;
            self.store.set_state_bool(keys::RUNNER_BUSY, false).await?;
            debug!("session {}: runner gone, prompt {} requeued", self.id, entry.id);
            return Ok(());
        }

        info!("session {}: dispatched prompt {}", self.id, entry.id);
        Ok(())
    }

    /// Queue drain after `complete` or `aborted` from the runner.
    pub(crate) async fn drain_queue(&mut self) -> anyhow::Result<()> {
        self.store.complete_processing().await?;
        self.flush_metrics().await;

        if self.runner.is_none() {
            self.store.set_state_bool(keys::RUNNER_BUSY, false).await?;
            return Ok(());
        }

        match self.store.next_queued().await? {
            Some(next) => self.dispatch_prompt(next).await?,
            None => {
                self.store.set_state_bool(keys::RUNNER_BUSY, false).await?;
                self.store.delete_state(keys::CURRENT_AUTHOR).await?;
                self.broadcast(ClientEvent::AgentStatus {
                    activity: serde_json::json!("idle"),
                });
                // Back to idle: the idle-hibernate deadline arms again.
                self.reschedule_alarm().await?;
            }
        }
        Ok(())
    }

    /// Non-interrupt abort: clear the queue, signal the runner, report idle
    /// optimistically. The `aborted` acknowledgement performs the real drain.
    pub(crate) async fn abort_turn(&mut self) -> anyhow::Result<()> {
        let cleared = self.store.clear_queued().await?;
        self.send_runner(RunnerCommand::Abort);
        self.broadcast(ClientEvent::AgentStatus {
            activity: serde_json::json!("idle"),
        });
        debug!("session {}: abort requested ({} queued cleared)", self.id, cleared);
        Ok(())
    }

    /// Delete the transcript suffix from the given message onward and tell
    /// the runner to do the same with its internal history.
    pub(crate) async fn revert_to(&mut self, message_id: &str) -> anyhow::Result<()> {
        let Some(message) = self.store.get_message(message_id).await? else {
            anyhow::bail!("cannot revert: unknown message {}", message_id);
        };

        let removed = self.store.delete_messages_from(message.created_at).await?;
        self.store.remove_queued_ids(&removed).await?;

        self.broadcast(ClientEvent::MessagesRemoved {
            ids: removed.clone(),
        });
        self.send_runner(RunnerCommand::Revert {
            message_id: message_id.to_string(),
        });

        info!(
            "session {}: reverted {} messages from {}",
            self.id,
            removed.len(),
            message_id
        );
        Ok(())
    }
}
