//! Session registry: one agent per session id, created on `start` and
//! lazily re-opened from disk for sessions that already have a database.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use log::{info, warn};

use super::agent::{AgentError, SessionAgent, SessionHandle};
use super::store::SessionStore;
use crate::crypto::TokenSealer;
use crate::db::{Database, session_db_path};
use crate::directory::Directory;
use crate::events::EventBus;
use crate::github::GitProviderClient;
use crate::sandbox::Provisioner;

/// External collaborators shared by every session agent.
pub struct SessionDeps {
    pub directory: Arc<dyn Directory>,
    pub provisioner: Arc<dyn Provisioner>,
    pub events: Arc<dyn EventBus>,
    pub git: GitProviderClient,
    pub sealer: TokenSealer,
    pub default_idle_timeout_ms: i64,
}

/// Addressable map of live session agents.
pub struct SessionRegistry {
    data_dir: PathBuf,
    deps: Arc<SessionDeps>,
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new(data_dir: PathBuf, deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            data_dir,
            deps: Arc::new(deps),
            sessions: DashMap::new(),
        })
    }

    pub fn deps(&self) -> &Arc<SessionDeps> {
        &self.deps
    }

    /// Get the handle for a session, creating its agent (and database) when
    /// absent. Used by `start` and child spawning.
    pub async fn ensure(self: &Arc<Self>, session_id: &str) -> Result<SessionHandle, AgentError> {
        validate_session_id(session_id)?;
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(handle.clone());
        }
        self.spawn_agent(session_id).await
    }

    /// Get the handle for an existing session: live in the map, or re-opened
    /// from its database file. Unknown sessions return `None`.
    pub async fn get(self: &Arc<Self>, session_id: &str) -> Result<Option<SessionHandle>, AgentError> {
        validate_session_id(session_id)?;
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(Some(handle.clone()));
        }
        if !session_db_path(&self.data_dir, session_id).exists() {
            return Ok(None);
        }
        self.spawn_agent(session_id).await.map(Some)
    }

    fn spawn_agent<'a>(
        self: &'a Arc<Self>,
        session_id: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<SessionHandle, AgentError>> + Send + 'a>,
    > {
        Box::pin(async move {
        let path = session_db_path(&self.data_dir, session_id);
        let fresh = !path.exists();
        let db = Database::open(&path)
            .await
            .map_err(|e| AgentError::Internal(format!("{:#}", e)))?;
        let store = SessionStore::new(db);

        if !fresh {
            // Nothing from a previous process can still be attached.
            if let Err(e) = store.clear_connected_users().await {
                warn!("session {}: presence reset failed: {:#}", session_id, e);
            }
            if let Err(e) = store.requeue_processing().await {
                warn!("session {}: queue reset failed: {:#}", session_id, e);
            }
        }

        let (agent, handle) = SessionAgent::new(
            session_id.to_string(),
            store,
            self.deps.clone(),
            self.clone(),
        );

        // Another caller may have raced us here; only one agent may own the
        // database file.
        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                agent.store.close().await;
                Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                tokio::spawn(agent.run());
                info!("session {}: agent spawned", session_id);
                Ok(handle)
            }
        }
        })
    }

    /// Garbage-collect a session: wipe and close its store, drop the agent,
    /// and delete the database files.
    pub async fn gc(self: &Arc<Self>, session_id: &str) -> Result<(), AgentError> {
        let Some(handle) = self.get(session_id).await? else {
            return Err(AgentError::NotStarted);
        };
        handle.gc().await?;
        self.sessions.remove(session_id);

        let path = session_db_path(&self.data_dir, session_id);
        for suffix in ["", "-wal", "-shm"] {
            let target = PathBuf::from(format!("{}{}", path.display(), suffix));
            if target.exists() {
                if let Err(e) = std::fs::remove_file(&target) {
                    warn!("session {}: removing {} failed: {}", session_id, target.display(), e);
                }
            }
        }
        info!("session {}: garbage collected", session_id);
        Ok(())
    }

    /// Number of live agents (for the health endpoint).
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}

fn validate_session_id(session_id: &str) -> Result<(), AgentError> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AgentError::BadRequest(format!(
            "invalid session id: {}",
            session_id
        )))
    }
}
