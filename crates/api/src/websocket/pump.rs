//! Engine event pump
//!
//! Drains the engine's event channel and routes each event to the session's
//! room. Room membership follows the assignment: the assignee's connections
//! join on assignment or resume and are dropped when the session goes back to
//! the queue.

use deskchat_engine::{ChatEvent, EventReceiver};
use tokio::task::JoinHandle;

use super::events::ServerEvent;
use super::state::WebSocketState;

/// Spawn the pump; it ends when the engine drops its event sender
pub fn spawn_event_pump(mut rx: EventReceiver, ws_state: WebSocketState) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            route_event(&ws_state, event).await;
        }
        tracing::info!("Chat event pump stopped");
    })
}

pub async fn route_event(ws_state: &WebSocketState, event: ChatEvent) {
    let session_id = event.session_id();
    tracing::debug!(session_id = %session_id, event = event.kind(), "Routing chat event");

    match &event {
        ChatEvent::SessionAssigned { staff_username, .. }
        | ChatEvent::SessionResumed { staff_username, .. } => {
            for conn in ws_state.staff_connections(staff_username).await {
                ws_state.rooms.join(session_id, conn).await;
            }
        }
        ChatEvent::SessionEscalated { .. } => {
            ws_state
                .notify_supervisors(ServerEvent::from(event.clone()))
                .await;
        }
        _ => {}
    }

    ws_state
        .rooms
        .broadcast(&session_id, ServerEvent::from(event.clone()))
        .await;

    match event {
        ChatEvent::SessionRequeued { .. } | ChatEvent::SessionAbandoned { .. } => {
            ws_state.rooms.remove_staff(&session_id).await;
        }
        ChatEvent::SessionEnded { .. } => ws_state.rooms.close(&session_id).await,
        _ => {}
    }
}
