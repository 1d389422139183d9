//! WebSocket transport for guest chat
//!
//! # Architecture
//!
//! - **Connection**: an open socket, either a staff dashboard or a guest widget
//! - **Room**: per-session pub/sub holding the guest and the assigned staff
//! - **State**: global WebSocket state shared across all connections
//! - **Pump**: routes engine events into rooms
//! - **Handler**: Axum WebSocket route handlers
//! - **Events**: type-safe event definitions for client/server communication

pub mod connection;
pub mod events;
pub mod handler;
pub mod pump;
pub mod room;
pub mod state;

pub use handler::{guest_ws_handler, staff_ws_handler};
pub use pump::spawn_event_pump;
pub use state::WebSocketState;
