//! deskchat API Library
//!
//! HTTP and WebSocket surface over the guest chat engine.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
