//! WebSocket endpoint for both connection roles.
//!
//! `role=client` attaches a human user (requires `userId`); `role=runner`
//! attaches the sandboxed agent (requires the per-session `token`). The
//! socket task only shuttles frames: every parsed frame goes to the session's
//! single-writer loop, and outbound frames arrive on a per-connection channel.

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;

use tether_protocol::{ClientEvent, ClientMessage, RunnerMessage};

use super::error::ApiError;
use super::state::AppState;
use crate::session::SessionHandle;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub role: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /sessions/{session_id}/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let handle = state
        .registry
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::unknown_session(&session_id))?;

    match query.role.as_str() {
        "client" => {
            let user_id = query
                .user_id
                .ok_or_else(|| ApiError::malformed("userId is required for client role"))?;
            Ok(ws.on_upgrade(move |socket| client_connection(socket, handle, user_id)))
        }
        "runner" => {
            let token = query
                .token
                .ok_or_else(|| ApiError::malformed("token is required for runner role"))?;
            Ok(ws.on_upgrade(move |socket| runner_connection(socket, handle, token)))
        }
        other => Err(ApiError::malformed(format!(
            "unknown connection role: {}",
            other
        ))),
    }
}

async fn client_connection(socket: WebSocket, handle: SessionHandle, user_id: String) {
    let session_id = handle.session_id().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut events) = match handle.connect_client(user_id.clone()).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!("session {}: client attach rejected: {}", session_id, e);
            let _ = send_error(&mut sender, &e.to_string()).await;
            let _ = sender.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("session {}: event serialization failed: {}", session_id, e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // The agent dropped this connection (gc or shutdown).
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(frame) => handle.client_frame(conn_id, frame),
                            Err(e) => {
                                debug!("session {}: bad client frame: {}", session_id, e);
                                if send_error(&mut sender, &format!("invalid frame: {}", e))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("session {}: client socket error: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    handle.disconnect_client(conn_id);
    info!("session {}: client socket for {} closed", session_id, user_id);
}

async fn runner_connection(socket: WebSocket, handle: SessionHandle, token: String) {
    let session_id = handle.session_id().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut commands) = match handle.connect_runner(token).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!("session {}: runner attach rejected: {}", session_id, e);
            let _ = send_error(&mut sender, &e.to_string()).await;
            let _ = sender.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        let json = match serde_json::to_string(&command) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("session {}: command serialization failed: {}", session_id, e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Displaced by a newer runner connection or closed by
                        // the session; finish with a normal close.
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: "closed".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RunnerMessage>(&text) {
                            Ok(frame) => handle.runner_frame(conn_id, frame),
                            Err(e) => {
                                debug!("session {}: bad runner frame: {}", session_id, e);
                                if send_error(&mut sender, &format!("invalid frame: {}", e))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("session {}: runner socket error: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    handle.disconnect_runner(conn_id);
    info!("session {}: runner socket closed", session_id);
}

async fn send_error(
    sender: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    message: &str,
) -> Result<(), axum::Error> {
    let frame = ClientEvent::Error {
        message: message.to_string(),
    };
    let json = serde_json::to_string(&frame).unwrap_or_default();
    sender.send(Message::Text(json.into())).await
}
