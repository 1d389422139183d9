//! Chat session rooms for pub/sub
//!
//! One room per chat session, holding the guest's connections and those of
//! the staff member currently handling it.

use deskchat_shared::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;

/// Manages session "rooms" for broadcasting events
pub struct RoomManager {
    /// Map of session_id -> list of connections
    rooms: Arc<RwLock<HashMap<SessionId, Vec<Arc<Connection>>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a connection to a session room. Joining twice is a no-op.
    pub async fn join(&self, session_id: SessionId, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(session_id).or_default();
        if members.iter().any(|c| c.id == conn.id) {
            return;
        }
        members.push(Arc::clone(&conn));

        tracing::debug!(
            session_id = %session_id,
            connection_id = %conn.id,
            room_size = members.len(),
            "Connection joined session room"
        );
    }

    /// Drop staff connections from a room, keeping the guest's
    pub async fn remove_staff(&self, session_id: &SessionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(session_id) {
            conns.retain(|c| !c.is_staff());
            if conns.is_empty() {
                rooms.remove(session_id);
            }
        }
    }

    /// Remove a whole room, e.g. once its session has ended
    pub async fn close(&self, session_id: &SessionId) {
        if self.rooms.write().await.remove(session_id).is_some() {
            tracing::debug!(session_id = %session_id, "Closed session room");
        }
    }

    /// Broadcast an event to all connections in a session room
    ///
    /// Silently ignores send errors (closed connections will be cleaned up)
    pub async fn broadcast(&self, session_id: &SessionId, event: ServerEvent) {
        let rooms = self.rooms.read().await;
        let Some(conns) = rooms.get(session_id) else {
            tracing::debug!(session_id = %session_id, "No subscribers for session");
            return;
        };

        let mut failed_count = 0;
        for conn in conns {
            if conn.send(event.clone()).is_err() {
                failed_count += 1;
                tracing::warn!(
                    connection_id = %conn.id,
                    "Failed to send event to connection (likely closed)"
                );
            }
        }

        tracing::debug!(
            session_id = %session_id,
            recipients = conns.len() - failed_count,
            failed = failed_count,
            "Broadcast event to session room"
        );
    }

    /// Remove a connection from all rooms
    pub async fn remove_connection(&self, connection_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        for conns in rooms.values_mut() {
            conns.retain(|c| c.id != *connection_id);
        }
        rooms.retain(|_, conns| !conns.is_empty());
    }

    pub async fn get_room_size(&self, session_id: &SessionId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(session_id).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn get_room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
