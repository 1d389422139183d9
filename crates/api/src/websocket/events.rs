//! WebSocket event types and serialization
//!
//! Server frames are either a control frame or an engine [`ChatEvent`]
//! forwarded as is; both carry a `type` tag.

use deskchat_engine::{ChatEvent, ChatSession};
use deskchat_shared::{SessionId, WorkMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Post a chat message. Guests may omit the session, it is implied by
    /// their connection.
    SendMessage {
        #[serde(default)]
        session_id: Option<SessionId>,
        content: String,
    },

    /// Change work mode (staff only)
    SetMode { mode: WorkMode },

    /// Heartbeat ping to keep connection alive; counts as guest activity
    Ping,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Frames owned by the transport rather than the engine
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Connection acknowledged
    Connected { connection_id: Uuid },

    /// Current state of a session, sent to a guest on connect and to staff
    /// for each chat they hold
    SessionSnapshot { session: Box<ChatSession> },

    /// Heartbeat response
    Pong,

    /// Error message
    Error { message: String },
}

/// Everything sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum ServerEvent {
    Control(ControlEvent),
    Chat(ChatEvent),
}

impl ServerEvent {
    pub fn connected(connection_id: Uuid) -> Self {
        Self::Control(ControlEvent::Connected { connection_id })
    }

    pub fn snapshot(session: ChatSession) -> Self {
        Self::Control(ControlEvent::SessionSnapshot {
            session: Box::new(session),
        })
    }

    pub fn pong() -> Self {
        Self::Control(ControlEvent::Pong)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Control(ControlEvent::Error {
            message: message.into(),
        })
    }
}

impl From<ChatEvent> for ServerEvent {
    fn from(event: ChatEvent) -> Self {
        Self::Chat(event)
    }
}
