//! Events produced by the chat engine
//!
//! The engine never talks to sockets. Each state transition emits a typed
//! [`ChatEvent`] on an unbounded channel; the transport layer owns the receiver
//! and decides framing and routing.

use deskchat_shared::{ChatPriority, SessionId, WorkMode};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::ChatMessage;

/// Engine-to-transport notification
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Session picked up by an agent
    SessionAssigned {
        session_id: SessionId,
        staff_username: String,
        staff_display_name: String,
        staff_mode: WorkMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        guest_message: Option<String>,
    },

    /// Session went back to the waiting queue after its agent was lost
    SessionRequeued {
        session_id: SessionId,
        new_priority: ChatPriority,
        new_queue_position: i32,
        guest_message: String,
    },

    SessionEscalated {
        session_id: SessionId,
        priority: ChatPriority,
    },

    /// Returning guest re-attached to a prior session
    SessionRecovered {
        session_id: SessionId,
        message_history: Vec<ChatMessage>,
    },

    QueuePositionUpdated {
        session_id: SessionId,
        queue_position: i32,
        guest_message: String,
    },

    MessagePosted {
        session_id: SessionId,
        message: ChatMessage,
    },

    /// Same agent came back within the grace window
    SessionResumed {
        session_id: SessionId,
        staff_username: String,
    },

    SessionAbandoned { session_id: SessionId },

    SessionEnded { session_id: SessionId },
}

impl ChatEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SessionAssigned { session_id, .. }
            | Self::SessionRequeued { session_id, .. }
            | Self::SessionEscalated { session_id, .. }
            | Self::SessionRecovered { session_id, .. }
            | Self::QueuePositionUpdated { session_id, .. }
            | Self::MessagePosted { session_id, .. }
            | Self::SessionResumed { session_id, .. }
            | Self::SessionAbandoned { session_id }
            | Self::SessionEnded { session_id } => *session_id,
        }
    }

    /// Event type name as serialized in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionAssigned { .. } => "session_assigned",
            Self::SessionRequeued { .. } => "session_requeued",
            Self::SessionEscalated { .. } => "session_escalated",
            Self::SessionRecovered { .. } => "session_recovered",
            Self::QueuePositionUpdated { .. } => "queue_position_updated",
            Self::MessagePosted { .. } => "message_posted",
            Self::SessionResumed { .. } => "session_resumed",
            Self::SessionAbandoned { .. } => "session_abandoned",
            Self::SessionEnded { .. } => "session_ended",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Cloneable sending half handed to every engine component
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ChatEvent) {
        let kind = event.kind();
        let session_id = event.session_id();
        if self.tx.send(event).is_err() {
            // Receiver gone during shutdown; nothing left to notify
            tracing::debug!(session_id = %session_id, event = kind, "Dropping chat event, no receiver");
        }
    }
}
