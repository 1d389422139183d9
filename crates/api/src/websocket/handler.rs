//! WebSocket handlers for Axum
//!
//! Staff authenticate with their JWT, guests with their session's recovery
//! token, both passed as a `token` query parameter since browsers cannot set
//! headers on WebSocket upgrades.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use deskchat_engine::EngineError;
use deskchat_shared::{SessionId, SessionStatus};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::{require_permission, StaffIdentity, PERMISSION_CHAT_HANDLE, PERMISSION_CHAT_SUPERVISE};
use crate::error::ApiError;
use crate::routes::staff::ensure_staff_registered;
use crate::state::AppState;

use super::{
    connection::{Connection, Peer},
    events::{ClientEvent, ServerEvent},
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: String,
}

/// Staff dashboard socket: `/ws/staff?token=<jwt>`
pub async fn staff_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, ApiError> {
    let identity = app_state
        .jwt
        .validate_staff_token(&params.token)
        .map_err(|e| {
            tracing::warn!(error = %e, "WebSocket auth failed: invalid staff token");
            ApiError::InvalidToken
        })?;
    require_permission(&identity, PERMISSION_CHAT_HANDLE)?;
    ensure_staff_registered(&app_state, &identity).await?;

    tracing::info!(staff = %identity.username, "Staff WebSocket upgrade requested");

    let peer = Peer::Staff {
        supervisor: identity.has_permission(PERMISSION_CHAT_SUPERVISE),
        username: identity.username.clone(),
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, peer, app_state)))
}

/// Guest widget socket: `/ws/guest?token=<recovery_token>`
pub async fn guest_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Result<Response, ApiError> {
    let session = app_state
        .engine
        .store()
        .get_session_by_token(&params.token)
        .await?
        .ok_or(ApiError::NotFound)?;
    if session.status == SessionStatus::Ended {
        return Err(ApiError::Conflict("Chat session has ended".to_string()));
    }

    tracing::info!(session_id = %session.id, "Guest WebSocket upgrade requested");

    let peer = Peer::Guest {
        session_id: session.id,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, peer, app_state)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, peer: Peer, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending events to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let ws_state = app_state.ws_state.clone();
    let conn = ws_state.add_connection(Connection::new(peer, tx)).await;
    let connection_id = conn.id;

    // Send connection acknowledgment
    let _ = conn.send(ServerEvent::connected(connection_id));

    match &conn.peer {
        Peer::Staff { username, .. } => on_staff_connected(&app_state, &conn, username).await,
        Peer::Guest { session_id } => on_guest_connected(&app_state, &conn, *session_id).await,
    }

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize WebSocket event");
                }
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let Ok(msg) = msg else { break };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_client_event(event, &conn, &app_state).await,
                Err(e) => {
                    tracing::warn!(error = ?e, connection_id = %connection_id, "Failed to parse client event");
                    let _ = conn.send(ServerEvent::error("Invalid event format"));
                }
            },
            Message::Close(_) => {
                tracing::info!(connection_id = %connection_id, "WebSocket close frame received");
                break;
            }
            // Axum answers ping/pong frames; binary frames are ignored
            _ => {}
        }
    }

    // Cleanup on disconnect
    tracing::info!(connection_id = %connection_id, peer = ?conn.peer, "WebSocket connection closing");
    ws_state.remove_connection(&connection_id).await;

    if let Some(username) = conn.staff_username() {
        if let Err(e) = app_state.engine.presence.connection_closed(username).await {
            tracing::error!(error = %e, staff = %username, "Failed to record staff disconnect");
        }
    }

    send_task.abort();
}

async fn on_staff_connected(app_state: &AppState, conn: &Arc<Connection>, username: &str) {
    // The first connection resumes grace-waiting chats; the pump joins this
    // connection to their rooms on the resulting events
    if let Err(e) = app_state.engine.presence.connection_opened(username).await {
        tracing::error!(error = %e, staff = %username, "Failed to record staff connection");
        let _ = conn.send(ServerEvent::error("Could not restore your chats, please reconnect"));
    }

    let store = app_state.engine.store();
    for status in [SessionStatus::Active, SessionStatus::StaffDisconnected] {
        match store.get_staff_sessions(username, status).await {
            Ok(sessions) => {
                for session in sessions {
                    app_state.ws_state.rooms.join(session.id, Arc::clone(conn)).await;
                    let _ = conn.send(ServerEvent::snapshot(session));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, staff = %username, "Failed to load staff sessions");
            }
        }
    }
}

async fn on_guest_connected(app_state: &AppState, conn: &Arc<Connection>, session_id: SessionId) {
    app_state.ws_state.rooms.join(session_id, Arc::clone(conn)).await;

    if let Err(e) = app_state.engine.supervisor.record_guest_activity(session_id).await {
        tracing::warn!(error = %e, session_id = %session_id, "Failed to record guest activity");
    }
    match app_state.engine.sessions.get(session_id).await {
        Ok(session) => {
            let _ = conn.send(ServerEvent::snapshot(session));
        }
        Err(e) => {
            tracing::error!(error = %e, session_id = %session_id, "Failed to load guest session");
        }
    }
}

/// Handle client event
async fn handle_client_event(event: ClientEvent, conn: &Arc<Connection>, app_state: &AppState) {
    let engine = &app_state.engine;

    let result = match (event, &conn.peer) {
        (ClientEvent::SendMessage { session_id, content }, Peer::Staff { username, .. }) => {
            match session_id {
                Some(id) => engine
                    .sessions
                    .post_staff_message(id, username, &content)
                    .await
                    .map(|_| ()),
                None => Err(EngineError::InvalidInput("session_id is required".to_string())),
            }
        }
        (ClientEvent::SendMessage { session_id, content }, Peer::Guest { session_id: own }) => {
            if session_id.is_some_and(|id| id != *own) {
                let _ = conn.send(ServerEvent::error("Access denied to session"));
                return;
            }
            engine
                .sessions
                .post_guest_message(*own, &content)
                .await
                .map(|_| ())
        }
        (ClientEvent::SetMode { mode }, Peer::Staff { username, .. }) => {
            engine.presence.set_mode(username, mode).await.map(|_| ())
        }
        (ClientEvent::SetMode { .. }, Peer::Guest { .. }) => {
            let _ = conn.send(ServerEvent::error("Only staff can change work mode"));
            return;
        }
        (ClientEvent::Ping, Peer::Guest { session_id }) => {
            let _ = conn.send(ServerEvent::pong());
            engine.supervisor.record_guest_activity(*session_id).await
        }
        (ClientEvent::Ping, Peer::Staff { .. }) => {
            let _ = conn.send(ServerEvent::pong());
            return;
        }
    };

    if let Err(e) = result {
        tracing::warn!(error = %e, connection_id = %conn.id, "Client event rejected");
        let fallback = match &conn.peer {
            Peer::Guest { .. } => engine.settings().current().await.reconnecting_message.clone(),
            Peer::Staff { .. } => STAFF_FALLBACK_MESSAGE.to_string(),
        };
        let _ = conn.send(ServerEvent::error(client_message(&e, &fallback)));
    }
}

const STAFF_FALLBACK_MESSAGE: &str = "Request failed, please try again";

/// Error text safe to show on the socket. Infrastructure failures are
/// replaced by `fallback`.
fn client_message(err: &EngineError, fallback: &str) -> String {
    match err {
        EngineError::Database(_) | EngineError::Internal(_) | EngineError::Contention(_) => {
            fallback.to_string()
        }
        other => other.to_string(),
    }
}
