//! WebSocket connection management
//!
//! Represents an authenticated WebSocket connection, either a staff member's
//! dashboard or a guest's chat widget.

use deskchat_shared::SessionId;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::ServerEvent;

/// Who is on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Staff {
        username: String,
        /// Receives escalations for the whole queue
        supervisor: bool,
    },
    /// A guest is bound to exactly one chat session
    Guest { session_id: SessionId },
}

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique ID for this connection
    pub id: Uuid,

    pub peer: Peer,

    /// Channel to send events to this connection
    pub sender: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    pub fn new(peer: Peer, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            sender,
        }
    }

    /// Send an event to this connection
    ///
    /// Returns Ok(()) if sent successfully, Err if connection is closed
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    pub fn staff_username(&self) -> Option<&str> {
        match &self.peer {
            Peer::Staff { username, .. } => Some(username),
            Peer::Guest { .. } => None,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.peer, Peer::Staff { .. })
    }

    pub fn is_supervisor(&self) -> bool {
        matches!(self.peer, Peer::Staff { supervisor: true, .. })
    }
}
