//! Global WebSocket state management
//!
//! Maintains global state for all WebSocket connections and rooms.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;
use super::room::RoomManager;

/// Global WebSocket state shared across all connections
#[derive(Clone)]
pub struct WebSocketState {
    /// All active connections indexed by connection id
    pub connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,

    /// Room manager for chat sessions
    pub rooms: Arc<RoomManager>,
}

impl WebSocketState {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RoomManager::new()),
        }
    }

    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut connections = self.connections.write().await;
        connections.insert(conn.id, Arc::clone(&conn));

        tracing::info!(
            connection_id = %conn.id,
            peer = ?conn.peer,
            total_connections = connections.len(),
            "WebSocket connection added"
        );

        conn
    }

    pub async fn remove_connection(&self, connection_id: &Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.remove(connection_id) {
            // Also remove from all rooms
            self.rooms.remove_connection(connection_id).await;

            tracing::info!(
                connection_id = %connection_id,
                peer = ?conn.peer,
                remaining_connections = connections.len(),
                "WebSocket connection removed"
            );
        }
    }

    /// All live connections of one staff member
    pub async fn staff_connections(&self, username: &str) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.staff_username() == Some(username))
            .cloned()
            .collect()
    }

    /// Send to every supervisor connection
    pub async fn notify_supervisors(&self, event: ServerEvent) {
        let connections = self.connections.read().await;
        for conn in connections.values().filter(|c| c.is_supervisor()) {
            let _ = conn.send(event.clone());
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            active_connections: self.connection_count().await,
            active_rooms: self.rooms.get_room_count().await,
        }
    }
}

impl Default for WebSocketState {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about WebSocket connections
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebSocketStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}
