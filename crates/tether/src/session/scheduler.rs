//! Single programmable alarm per session.
//!
//! One deadline serves both the idle-hibernate timeout and pending-question
//! expiry: the alarm is always armed for whichever comes first. Firing posts
//! an `AlarmFired` event onto the agent's channel so the handler runs on the
//! single writer like everything else.

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::agent::{AgentEvent, SessionAgent};
use super::store::keys;
use tether_protocol::{ClientEvent, RunnerCommand};

/// Synthetic answer delivered to the runner when a question times out.
pub const EXPIRED_ANSWER: &str = "__expired__";

pub(crate) struct Alarm {
    deadline: Option<DateTime<Utc>>,
    task: Option<JoinHandle<()>>,
}

impl Alarm {
    pub(crate) fn new() -> Self {
        Self {
            deadline: None,
            task: None,
        }
    }

    /// Arm for the given instant, replacing any earlier schedule. Re-arming
    /// for the current deadline is a no-op.
    pub(crate) fn arm(&mut self, at: DateTime<Utc>, tx: mpsc::UnboundedSender<AgentEvent>) {
        if self.deadline == Some(at) && self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.disarm();
        self.deadline = Some(at);

        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = tx.send(AgentEvent::AlarmFired);
        }));
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.deadline = None;
    }

    pub(crate) fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }
}

impl SessionAgent {
    pub(crate) async fn idle_timeout_ms(&self) -> anyhow::Result<i64> {
        let configured = self
            .store
            .get_state(keys::IDLE_TIMEOUT_MS)
            .await?
            .and_then(|raw| raw.parse().ok());
        Ok(configured.unwrap_or(self.deps.default_idle_timeout_ms))
    }

    /// Whether the session is eligible for idle hibernation at all: running,
    /// runner idle, queue empty. A busy or backlogged session never arms the
    /// idle deadline — an elapsed deadline would otherwise refire instantly
    /// on every re-arm while a long tool call runs.
    async fn idle_hibernate_eligible(&self) -> anyhow::Result<bool> {
        Ok(self.current_status().await.ok().flatten()
            == Some(super::models::SessionStatus::Running)
            && !self.store.get_state_bool(keys::RUNNER_BUSY).await?
            && self.store.queue_depth().await? == 0)
    }

    /// Arm the alarm for min(idle deadline, earliest question expiry). While
    /// the runner is busy (or prompts are queued) only question expiry arms;
    /// the idle deadline comes back through the queue drain once it runs dry.
    pub(crate) async fn reschedule_alarm(&mut self) -> anyhow::Result<()> {
        let mut next: Option<DateTime<Utc>> = None;

        if self.idle_hibernate_eligible().await? {
            if let Some(raw) = self.store.get_state(keys::LAST_ACTIVITY_AT).await? {
                let last_activity = super::store::parse_ts(&raw)?;
                let deadline =
                    last_activity + chrono::Duration::milliseconds(self.idle_timeout_ms().await?);
                next = Some(deadline);
            }
        }

        if let Some(expiry) = self.store.earliest_pending_expiry().await? {
            next = Some(match next {
                Some(current) => current.min(expiry),
                None => expiry,
            });
        }

        match next {
            Some(at) => self.alarm.arm(at, self.self_tx.clone()),
            None => self.alarm.disarm(),
        }
        Ok(())
    }

    pub(crate) async fn on_alarm(&mut self) -> anyhow::Result<()> {
        let now = Utc::now();
        debug!("session {}: alarm fired", self.id);

        // Idle hibernation: only when genuinely idle past the threshold. A
        // busy runner or a non-empty queue means work is still pending, and a
        // hibernated session with queued work would never wake on its own.
        if self.idle_hibernate_eligible().await? {
            if let Some(raw) = self.store.get_state(keys::LAST_ACTIVITY_AT).await? {
                let last_activity = super::store::parse_ts(&raw)?;
                let idle_for = now - last_activity;
                if idle_for >= chrono::Duration::milliseconds(self.idle_timeout_ms().await?) {
                    self.begin_hibernate().await?;
                }
            }
        }

        self.flush_metrics().await;

        for question in self.store.expire_due_questions(now).await? {
            self.broadcast(ClientEvent::Status {
                lifecycle: None,
                runner_connected: None,
                question_expired: Some(question.id.clone()),
            });
            self.send_runner(RunnerCommand::Answer {
                question_id: question.id,
                answer: EXPIRED_ANSWER.to_string(),
            });
        }

        self.reschedule_alarm().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alarm_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        alarm.arm(Utc::now() + chrono::Duration::milliseconds(10), tx);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("alarm should fire");
        assert!(matches!(event, Some(AgentEvent::AlarmFired)));
    }

    #[tokio::test]
    async fn test_disarm_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        alarm.arm(Utc::now() + chrono::Duration::milliseconds(20), tx);
        alarm.disarm();
        assert!(alarm.deadline().is_none());

        let fired = tokio::time::timeout(std::time::Duration::from_millis(80), rx.recv()).await;
        assert!(fired.is_err(), "disarmed alarm must not fire");
    }

    #[tokio::test]
    async fn test_rearm_moves_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        // Far-future deadline replaced by a near one.
        alarm.arm(Utc::now() + chrono::Duration::days(1), tx.clone());
        alarm.arm(Utc::now() + chrono::Duration::milliseconds(10), tx);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("rearmed alarm should fire");
        assert!(matches!(event, Some(AgentEvent::AlarmFired)));
    }
}
