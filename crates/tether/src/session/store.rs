//! Per-session durable store.
//!
//! Wraps the session's sqlite database with typed accessors for the
//! transcript, prompt queue, questions, key/value state, connected users,
//! and audit log. All timestamps are RFC 3339 with microsecond precision so
//! lexicographic order equals chronological order.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use tether_protocol::{MessageParts, Role, TranscriptMessage};

use super::models::{AuditEntry, PromptStatus, QueueEntry, Question, QuestionStatus};
use crate::db::Database;

/// Well-known keys in the `state` table.
pub mod keys {
    pub const SESSION_ID: &str = "session_id";
    pub const USER_ID: &str = "user_id";
    pub const WORKSPACE: &str = "workspace";
    pub const RUNNER_TOKEN: &str = "runner_token";
    pub const STATUS: &str = "status";
    pub const SANDBOX_ID: &str = "sandbox_id";
    pub const TUNNELS: &str = "tunnels";
    pub const SNAPSHOT_ID: &str = "snapshot_id";
    pub const RUNNER_BUSY: &str = "runner_busy";
    pub const LAST_ACTIVITY_AT: &str = "last_activity_at";
    pub const RUNNING_SINCE: &str = "running_since";
    pub const IDLE_TIMEOUT_MS: &str = "idle_timeout_ms";
    pub const BACKEND_URL: &str = "backend_url";
    pub const TERMINATE_URL: &str = "terminate_url";
    pub const HIBERNATE_URL: &str = "hibernate_url";
    pub const RESTORE_URL: &str = "restore_url";
    pub const SPAWN_REQUEST: &str = "spawn_request";
    pub const INITIAL_PROMPT: &str = "initial_prompt";
    pub const INITIAL_MODEL: &str = "initial_model";
    pub const MODELS: &str = "models";
    pub const TITLE: &str = "title";
    pub const CURRENT_AUTHOR: &str = "current_author";
}

/// Serialize a timestamp the way this store orders by.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written with [`format_ts`].
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("parsing stored timestamp: {}", raw))
}

/// Repository over one session's database.
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    // ========================================================================
    // Key/value state
    // ========================================================================

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("reading state key {}", key))?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await
        .with_context(|| format!("writing state key {}", key))?;
        Ok(())
    }

    pub async fn delete_state(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM state WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await
            .with_context(|| format!("deleting state key {}", key))?;
        Ok(())
    }

    pub async fn get_state_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_state(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("decoding state key {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_state_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .with_context(|| format!("encoding state key {}", key))?;
        self.set_state(key, &raw).await
    }

    pub async fn get_state_bool(&self, key: &str) -> Result<bool> {
        Ok(self.get_state(key).await?.as_deref() == Some("true"))
    }

    pub async fn set_state_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_state(key, if value { "true" } else { "false" })
            .await
    }

    // ========================================================================
    // Transcript
    // ========================================================================

    pub async fn insert_message(&self, msg: &TranscriptMessage) -> Result<()> {
        let parts = msg
            .parts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("encoding message parts")?;

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, role, content, parts,
                author_id, author_email, author_name, author_avatar, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(msg.role.to_string())
        .bind(&msg.content)
        .bind(parts)
        .bind(&msg.author_id)
        .bind(&msg.author_email)
        .bind(&msg.author_name)
        .bind(&msg.author_avatar)
        .bind(format_ts(msg.created_at))
        .execute(self.pool())
        .await
        .context("inserting message")?;

        Ok(())
    }

    /// Upsert a tool message by call id. Returns true when the row was newly
    /// inserted, false when an existing row was updated.
    pub async fn upsert_tool_message(
        &self,
        call_id: &str,
        content: &str,
        parts: &MessageParts,
    ) -> Result<bool> {
        let encoded = serde_json::to_string(parts).context("encoding tool parts")?;

        let updated = sqlx::query("UPDATE messages SET content = ?, parts = ? WHERE id = ?")
            .bind(content)
            .bind(&encoded)
            .bind(call_id)
            .execute(self.pool())
            .await
            .context("updating tool message")?;

        if updated.rows_affected() > 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO messages (id, role, content, parts, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(call_id)
        .bind(Role::Tool.to_string())
        .bind(content)
        .bind(&encoded)
        .bind(format_ts(Utc::now()))
        .execute(self.pool())
        .await
        .context("inserting tool message")?;

        Ok(true)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<TranscriptMessage>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, role, content, parts, author_id, author_email, author_name,
                    author_avatar, created_at
             FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching message")?;

        row.map(MessageRow::into_message).transpose()
    }

    /// Full transcript in creation order.
    pub async fn all_messages(&self) -> Result<Vec<TranscriptMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, role, content, parts, author_id, author_email, author_name,
                    author_avatar, created_at
             FROM messages ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("listing messages")?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// With `after`: the oldest `limit` messages strictly after the cursor.
    /// Without: the most recent `limit` messages, still in chronological order.
    pub async fn list_messages(
        &self,
        limit: i64,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<TranscriptMessage>> {
        let rows: Vec<MessageRow> = match after {
            Some(cursor) => {
                sqlx::query_as(
                    "SELECT id, role, content, parts, author_id, author_email, author_name,
                            author_avatar, created_at
                     FROM messages WHERE created_at > ?
                     ORDER BY created_at ASC, rowid ASC LIMIT ?",
                )
                .bind(format_ts(cursor))
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM (
                        SELECT id, role, content, parts, author_id, author_email, author_name,
                               author_avatar, created_at
                        FROM messages ORDER BY created_at DESC, rowid DESC LIMIT ?
                     ) ORDER BY created_at ASC, rowid ASC",
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
        }
        .context("listing messages")?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Delete every message created at or after the given instant. Returns the
    /// removed ids in creation order.
    pub async fn delete_messages_from(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = format_ts(cutoff);

        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM messages WHERE created_at >= ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await
        .context("selecting messages to revert")?;

        sqlx::query("DELETE FROM messages WHERE created_at >= ?")
            .bind(&cutoff)
            .execute(self.pool())
            .await
            .context("deleting reverted messages")?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    pub async fn message_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(self.pool())
            .await
            .context("counting messages")?;
        Ok(count)
    }

    // ========================================================================
    // Prompt queue
    // ========================================================================

    pub async fn enqueue_prompt(&self, entry: &QueueEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prompt_queue (
                id, content, model, status, author_id, author_email, author_name, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.content)
        .bind(&entry.model)
        .bind(entry.status.to_string())
        .bind(&entry.author_id)
        .bind(&entry.author_email)
        .bind(&entry.author_name)
        .bind(&entry.created_at)
        .execute(self.pool())
        .await
        .context("enqueueing prompt")?;
        Ok(())
    }

    /// The oldest entry still waiting for dispatch.
    pub async fn next_queued(&self) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(
            "SELECT id, content, model, status, author_id, author_email, author_name, created_at
             FROM prompt_queue WHERE status = 'queued'
             ORDER BY created_at ASC, rowid ASC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .context("fetching next queued prompt")?;
        Ok(entry)
    }

    pub async fn processing_entry(&self) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>(
            "SELECT id, content, model, status, author_id, author_email, author_name, created_at
             FROM prompt_queue WHERE status = 'processing' LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .context("fetching processing prompt")?;
        Ok(entry)
    }

    pub async fn set_prompt_status(&self, id: &str, status: PromptStatus) -> Result<()> {
        sqlx::query("UPDATE prompt_queue SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(self.pool())
            .await
            .context("updating prompt status")?;
        Ok(())
    }

    /// Mark the current `processing` entry `completed`, if any.
    pub async fn complete_processing(&self) -> Result<()> {
        sqlx::query("UPDATE prompt_queue SET status = 'completed' WHERE status = 'processing'")
            .execute(self.pool())
            .await
            .context("completing processing prompt")?;
        Ok(())
    }

    /// Revert any `processing` entry to `queued` (runner went away mid-turn).
    pub async fn requeue_processing(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE prompt_queue SET status = 'queued' WHERE status = 'processing'")
                .execute(self.pool())
                .await
                .context("requeueing processing prompt")?;
        Ok(result.rows_affected())
    }

    /// Drop all `queued` entries. Returns how many were removed.
    pub async fn clear_queued(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM prompt_queue WHERE status = 'queued'")
            .execute(self.pool())
            .await
            .context("clearing prompt queue")?;
        Ok(result.rows_affected())
    }

    /// Drop queued entries whose ids are in the given set (used by revert).
    pub async fn remove_queued_ids(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query("DELETE FROM prompt_queue WHERE id = ? AND status = 'queued'")
                .bind(id)
                .execute(self.pool())
                .await
                .context("removing reverted queue entry")?;
        }
        Ok(())
    }

    pub async fn queue_depth(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM prompt_queue WHERE status = 'queued'")
                .fetch_one(self.pool())
                .await
                .context("counting queued prompts")?;
        Ok(count)
    }

    // ========================================================================
    // Questions
    // ========================================================================

    pub async fn insert_question(&self, question: &Question) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO questions (id, text, options, status, answer, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&question.id)
        .bind(&question.text)
        .bind(&question.options)
        .bind(question.status.to_string())
        .bind(&question.answer)
        .bind(&question.created_at)
        .bind(&question.expires_at)
        .execute(self.pool())
        .await
        .context("inserting question")?;
        Ok(())
    }

    pub async fn pending_questions(&self) -> Result<Vec<Question>> {
        let questions = sqlx::query_as::<_, Question>(
            "SELECT id, text, options, status, answer, created_at, expires_at
             FROM questions WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("listing pending questions")?;
        Ok(questions)
    }

    /// Record an answer. Returns true only when the question was still
    /// pending; answering an answered or expired question is a no-op.
    pub async fn answer_question(&self, id: &str, answer: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE questions SET status = 'answered', answer = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(answer)
        .bind(id)
        .execute(self.pool())
        .await
        .context("answering question")?;
        Ok(result.rows_affected() > 0)
    }

    /// Expire every pending question whose expiry has passed. Returns the
    /// expired rows.
    pub async fn expire_due_questions(&self, now: DateTime<Utc>) -> Result<Vec<Question>> {
        let cutoff = format_ts(now);

        let due = sqlx::query_as::<_, Question>(
            "SELECT id, text, options, status, answer, created_at, expires_at
             FROM questions WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await
        .context("selecting due questions")?;

        if !due.is_empty() {
            sqlx::query(
                "UPDATE questions SET status = 'expired'
                 WHERE status = 'pending' AND expires_at <= ?",
            )
            .bind(&cutoff)
            .execute(self.pool())
            .await
            .context("expiring questions")?;
        }

        Ok(due)
    }

    pub async fn earliest_pending_expiry(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT expires_at FROM questions WHERE status = 'pending'
             ORDER BY expires_at ASC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .context("finding earliest question expiry")?;

        row.map(|(raw,)| parse_ts(&raw)).transpose()
    }

    pub async fn pending_question_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM questions WHERE status = 'pending'")
                .fetch_one(self.pool())
                .await
                .context("counting pending questions")?;
        Ok(count)
    }

    // ========================================================================
    // Connected users
    // ========================================================================

    /// Record one more connection for the user. Returns true when this is the
    /// user's first open connection.
    pub async fn user_connected(&self, user_id: &str) -> Result<bool> {
        sqlx::query(
            "INSERT INTO connected_users (user_id, connections) VALUES (?, 1)
             ON CONFLICT(user_id) DO UPDATE SET connections = connections + 1",
        )
        .bind(user_id)
        .execute(self.pool())
        .await
        .context("recording user connection")?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT connections FROM connected_users WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(self.pool())
                .await
                .context("reading connection count")?;
        Ok(count == 1)
    }

    /// Record one connection gone. Returns true when the user has no open
    /// connections left (and the row is removed).
    pub async fn user_disconnected(&self, user_id: &str) -> Result<bool> {
        sqlx::query(
            "UPDATE connected_users SET connections = connections - 1 WHERE user_id = ?",
        )
        .bind(user_id)
        .execute(self.pool())
        .await
        .context("recording user disconnection")?;

        let result = sqlx::query("DELETE FROM connected_users WHERE user_id = ? AND connections <= 0")
            .bind(user_id)
            .execute(self.pool())
            .await
            .context("removing disconnected user")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn connected_user_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM connected_users ORDER BY user_id")
                .fetch_all(self.pool())
                .await
                .context("listing connected users")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Drop all presence rows. Used when an agent loads after a restart and
    /// no sockets can still be open.
    pub async fn clear_connected_users(&self) -> Result<()> {
        sqlx::query("DELETE FROM connected_users")
            .execute(self.pool())
            .await
            .context("clearing connected users")?;
        Ok(())
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    pub async fn append_audit(
        &self,
        event: &str,
        summary: &str,
        actor: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<AuditEntry> {
        let created_at = format_ts(Utc::now());
        let metadata_raw = metadata
            .map(serde_json::to_string)
            .transpose()
            .context("encoding audit metadata")?;

        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO audit_log (event, summary, actor, metadata, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING seq",
        )
        .bind(event)
        .bind(summary)
        .bind(actor)
        .bind(&metadata_raw)
        .bind(&created_at)
        .fetch_one(self.pool())
        .await
        .context("appending audit entry")?;

        Ok(AuditEntry {
            seq,
            event: event.to_string(),
            summary: summary.to_string(),
            actor: actor.map(|a| a.to_string()),
            metadata: metadata_raw,
            created_at,
            flushed: false,
        })
    }

    pub async fn unflushed_audit(&self) -> Result<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            "SELECT seq, event, summary, actor, metadata, created_at, flushed
             FROM audit_log WHERE flushed = 0 ORDER BY seq ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("listing unflushed audit entries")?;
        Ok(entries)
    }

    pub async fn mark_audit_flushed(&self, up_to_seq: i64) -> Result<()> {
        sqlx::query("UPDATE audit_log SET flushed = 1 WHERE seq <= ?")
            .bind(up_to_seq)
            .execute(self.pool())
            .await
            .context("marking audit entries flushed")?;
        Ok(())
    }

    /// Destroy every row in the store. Used by `gc`.
    pub async fn wipe(&self) -> Result<()> {
        for table in [
            "messages",
            "prompt_queue",
            "questions",
            "connected_users",
            "audit_log",
            "state",
        ] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(self.pool())
                .await
                .with_context(|| format!("wiping table {}", table))?;
        }
        Ok(())
    }
}

/// Raw row shape; converted into the wire message type.
#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    parts: Option<String>,
    author_id: Option<String>,
    author_email: Option<String>,
    author_name: Option<String>,
    author_avatar: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<TranscriptMessage> {
        let role: Role = self
            .role
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("decoding message role")?;
        let parts = self
            .parts
            .as_deref()
            .map(serde_json::from_str::<MessageParts>)
            .transpose()
            .context("decoding message parts")?;

        Ok(TranscriptMessage {
            id: self.id,
            role,
            content: self.content,
            parts,
            author_id: self.author_id,
            author_email: self.author_email,
            author_name: self.author_name,
            author_avatar: self.author_avatar,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::ToolCallStatus;

    async fn store() -> SessionStore {
        SessionStore::new(Database::in_memory().await.unwrap())
    }

    fn user_msg(id: &str, content: &str) -> TranscriptMessage {
        let mut msg = TranscriptMessage::bare(id, Role::User, content);
        msg.author_id = Some("u1".to_string());
        msg
    }

    #[tokio::test]
    async fn test_transcript_order_and_revert() {
        let store = store().await;

        for (id, content) in [("m1", "one"), ("m2", "two"), ("m3", "three")] {
            store.insert_message(&user_msg(id, content)).await.unwrap();
        }

        let all = store.all_messages().await.unwrap();
        assert_eq!(
            all.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2", "m3"]
        );

        let cutoff = all[1].created_at;
        let removed = store.delete_messages_from(cutoff).await.unwrap();
        assert_eq!(removed, vec!["m2".to_string(), "m3".to_string()]);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tool_upsert_single_row() {
        let store = store().await;

        let inserted = store
            .upsert_tool_message(
                "c1",
                "bash",
                &MessageParts::Tool {
                    name: "bash".to_string(),
                    status: ToolCallStatus::Pending,
                    args: None,
                    result: None,
                },
            )
            .await
            .unwrap();
        assert!(inserted);

        let inserted = store
            .upsert_tool_message(
                "c1",
                "bash",
                &MessageParts::Tool {
                    name: "bash".to_string(),
                    status: ToolCallStatus::Completed,
                    args: None,
                    result: Some(serde_json::json!({"ok": true})),
                },
            )
            .await
            .unwrap();
        assert!(!inserted);

        assert_eq!(store.message_count().await.unwrap(), 1);
        let msg = store.get_message("c1").await.unwrap().unwrap();
        match msg.parts.unwrap() {
            MessageParts::Tool { status, .. } => assert_eq!(status, ToolCallStatus::Completed),
            _ => panic!("wrong parts"),
        }
    }

    #[tokio::test]
    async fn test_queue_discipline() {
        let store = store().await;
        let now = format_ts(Utc::now());

        for id in ["p1", "p2"] {
            store
                .enqueue_prompt(&QueueEntry {
                    id: id.to_string(),
                    content: id.to_string(),
                    model: None,
                    status: PromptStatus::Queued,
                    author_id: Some("u1".to_string()),
                    author_email: None,
                    author_name: None,
                    created_at: now.clone(),
                })
                .await
                .unwrap();
        }

        let next = store.next_queued().await.unwrap().unwrap();
        assert_eq!(next.id, "p1");
        store
            .set_prompt_status("p1", PromptStatus::Processing)
            .await
            .unwrap();

        // Runner disconnect reverts processing back to queued.
        assert_eq!(store.requeue_processing().await.unwrap(), 1);
        assert_eq!(store.next_queued().await.unwrap().unwrap().id, "p1");

        store
            .set_prompt_status("p1", PromptStatus::Processing)
            .await
            .unwrap();
        store.complete_processing().await.unwrap();
        assert_eq!(store.next_queued().await.unwrap().unwrap().id, "p2");
        assert_eq!(store.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_question_expiry_boundary() {
        let store = store().await;
        let now = Utc::now();

        store
            .insert_question(&Question {
                id: "q1".to_string(),
                text: "ready?".to_string(),
                options: None,
                status: QuestionStatus::Pending,
                answer: None,
                created_at: format_ts(now),
                expires_at: format_ts(now),
            })
            .await
            .unwrap();

        // Expiry at exactly the expiry instant.
        let due = store.expire_due_questions(now).await.unwrap();
        assert_eq!(due.len(), 1);

        // Answering after expiry is a no-op.
        assert!(!store.answer_question("q1", "yes").await.unwrap());
    }

    #[tokio::test]
    async fn test_connected_users_refcount() {
        let store = store().await;

        assert!(store.user_connected("u1").await.unwrap());
        assert!(!store.user_connected("u1").await.unwrap());
        assert!(!store.user_disconnected("u1").await.unwrap());
        assert!(store.user_disconnected("u1").await.unwrap());
        assert!(store.connected_user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_flush_cursor() {
        let store = store().await;

        let first = store
            .append_audit("session.started", "session started", None, None)
            .await
            .unwrap();
        store
            .append_audit("tool.completed", "bash finished", Some("runner"), None)
            .await
            .unwrap();

        assert_eq!(store.unflushed_audit().await.unwrap().len(), 2);
        store.mark_audit_flushed(first.seq).await.unwrap();
        let rest = store.unflushed_audit().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event, "tool.completed");
    }
}
