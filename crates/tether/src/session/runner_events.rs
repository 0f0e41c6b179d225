//! Runner protocol handler.
//!
//! Translates runner-originated frames into durable transcript rows, client
//! broadcasts, and directory writes. Cross-session and git-provider RPC
//! frames hand off to the coordinator.

use chrono::{Duration, Utc};
use log::{debug, warn};
use uuid::Uuid;

use tether_protocol::{
    ClientEvent, MessageParts, QuestionFrame, Role, RunnerCommand, RunnerMessage,
    TranscriptMessage,
};

use super::agent::SessionAgent;
use super::models::{Question, QuestionStatus};
use super::store::{format_ts, keys, parse_ts};
use crate::directory::GitStatePatch;

/// How long a question waits for a human before the scheduler expires it.
const QUESTION_TTL_MINUTES: i64 = 5;

impl SessionAgent {
    pub(crate) async fn on_runner_frame(&mut self, frame: RunnerMessage) -> anyhow::Result<()> {
        match frame {
            RunnerMessage::Stream { content } => {
                // Ephemeral: broadcast, never persist. Streaming counts as
                // activity for the idle clock.
                self.broadcast(ClientEvent::Chunk { content });
                self.touch_activity().await?;
            }

            RunnerMessage::Result { content } => {
                // A fresh id every time; the prompt id already names the user
                // message and must not be reused.
                let message =
                    TranscriptMessage::bare(Uuid::new_v4().to_string(), Role::Assistant, content);
                self.store.insert_message(&message).await?;
                self.broadcast(ClientEvent::Message { message });
            }

            RunnerMessage::Tool {
                call_id,
                name,
                status,
                args,
                result,
            } => {
                let parts = MessageParts::Tool {
                    name: name.clone(),
                    status,
                    args,
                    result,
                };
                let inserted = self.store.upsert_tool_message(&call_id, &name, &parts).await?;
                if let Some(message) = self.store.get_message(&call_id).await? {
                    if inserted {
                        self.broadcast(ClientEvent::Message { message });
                    } else {
                        self.broadcast(ClientEvent::MessageUpdated { message });
                    }
                }
                if status.is_final() {
                    self.audit(
                        "tool.finished",
                        &format!("{} {}", name, status),
                        Some("runner"),
                        Some(serde_json::json!({ "callId": call_id })),
                    )
                    .await;
                }
            }

            RunnerMessage::Question { text, options } => {
                let now = Utc::now();
                let question = Question {
                    id: Uuid::new_v4().to_string(),
                    text: text.clone(),
                    options: if options.is_empty() {
                        None
                    } else {
                        Some(serde_json::to_string(&options)?)
                    },
                    status: QuestionStatus::Pending,
                    answer: None,
                    created_at: format_ts(now),
                    expires_at: format_ts(now + Duration::minutes(QUESTION_TTL_MINUTES)),
                };
                self.store.insert_question(&question).await?;
                self.broadcast(ClientEvent::Question {
                    question: QuestionFrame {
                        id: question.id.clone(),
                        text,
                        options,
                        expires_at: parse_ts(&question.expires_at)?,
                    },
                });
                self.reschedule_alarm().await?;
            }

            RunnerMessage::Screenshot { data, description } => {
                let content = description.clone().unwrap_or_else(|| "Screenshot".to_string());
                let mut message =
                    TranscriptMessage::bare(Uuid::new_v4().to_string(), Role::System, content);
                message.parts = Some(MessageParts::Screenshot { data, description });
                self.store.insert_message(&message).await?;
                self.broadcast(ClientEvent::Message { message });
            }

            RunnerMessage::Error { message } => {
                self.system_message(&format!("Error: {}", message)).await?;
                self.broadcast(ClientEvent::Error {
                    message: message.clone(),
                });
                self.deps
                    .events
                    .publish(
                        &self.id,
                        "session.errored",
                        serde_json::json!({ "message": message }),
                    )
                    .await;
            }

            RunnerMessage::Complete => {
                self.drain_queue().await?;
            }

            RunnerMessage::AgentStatus { activity } => {
                self.broadcast(ClientEvent::AgentStatus { activity });
            }

            RunnerMessage::Aborted => {
                debug!("session {}: runner confirmed abort", self.id);
                self.drain_queue().await?;
            }

            RunnerMessage::Reverted => {
                debug!("session {}: runner confirmed revert", self.id);
            }

            RunnerMessage::Diff { request_id, diff } => {
                self.broadcast(ClientEvent::Diff { request_id, diff });
            }

            RunnerMessage::ReviewResult { request_id, result } => {
                self.broadcast(ClientEvent::ReviewResult { request_id, result });
            }

            RunnerMessage::Models { models } => {
                self.store.set_state_json(keys::MODELS, &models).await?;
                let owner = self.owner_id().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
                if let Err(e) = self
                    .deps
                    .directory
                    .save_model_catalogue(&owner, models.clone())
                    .await
                {
                    warn!("session {}: model catalogue save failed: {}", self.id, e);
                }
                self.broadcast(ClientEvent::Models { models });
            }

            RunnerMessage::ModelSwitched { from, to, reason } => {
                // Runner activity only; the idle clock is untouched.
                let note = match &reason {
                    Some(reason) => {
                        format!("Model switched from {} to {} ({})", from, to, reason)
                    }
                    None => format!("Model switched from {} to {}", from, to),
                };
                self.system_message(&note).await?;
                self.broadcast(ClientEvent::ModelSwitched { from, to, reason });
            }

            RunnerMessage::GitState {
                branch,
                base_branch,
                commit_count,
            } => {
                let patch = GitStatePatch {
                    branch,
                    base_branch,
                    commit_count,
                    ..Default::default()
                };
                if let Err(e) = self
                    .deps
                    .directory
                    .update_git_state(&self.id, patch.clone())
                    .await
                {
                    warn!("session {}: git-state write failed: {}", self.id, e);
                }
                self.broadcast(ClientEvent::GitState {
                    state: serde_json::to_value(&patch)?,
                });
            }

            RunnerMessage::PrCreated { pr } => {
                self.record_pr_created(&pr).await;
            }

            RunnerMessage::FilesChanged { files } => {
                for file in &files {
                    if let Err(e) = self
                        .deps
                        .directory
                        .upsert_file_change(
                            &self.id,
                            &file.path,
                            &file.status,
                            file.additions,
                            file.deletions,
                        )
                        .await
                    {
                        warn!("session {}: file-change write failed: {}", self.id, e);
                    }
                }
                self.broadcast(ClientEvent::FilesChanged { files });
            }

            RunnerMessage::ChildSession { session_id, title } => {
                self.broadcast(ClientEvent::ChildSession { session_id, title });
            }

            RunnerMessage::Title { title } => {
                self.store.set_state(keys::TITLE, &title).await?;
                if let Err(e) = self.deps.directory.set_session_title(&self.id, &title).await {
                    warn!("session {}: title write failed: {}", self.id, e);
                }
                self.broadcast(ClientEvent::Title { title });
            }

            RunnerMessage::Ping => {
                self.send_runner(RunnerCommand::Pong);
            }

            // Everything below is a tagged RPC answered with one *-result.
            rpc => self.handle_rpc(rpc).await?,
        }
        Ok(())
    }

    /// Shared bookkeeping for a PR coming into existence, whether reported by
    /// the runner or created through the provider bridge.
    pub(crate) async fn record_pr_created(&mut self, pr: &tether_protocol::runner::PrInfo) {
        let patch = GitStatePatch {
            pr_number: Some(pr.number),
            pr_url: Some(pr.url.clone()),
            pr_title: Some(pr.title.clone()),
            pr_state: pr.state.clone(),
            pr_created_at: pr.created_at.clone(),
            ..Default::default()
        };
        if let Err(e) = self.deps.directory.update_git_state(&self.id, patch).await {
            warn!("session {}: PR git-state write failed: {}", self.id, e);
        }

        self.broadcast(ClientEvent::PrCreated {
            pr: serde_json::to_value(pr).unwrap_or_default(),
        });
        self.audit(
            "pr.created",
            &format!("PR #{}: {}", pr.number, pr.title),
            None,
            Some(serde_json::json!({ "url": pr.url })),
        )
        .await;
    }
}
