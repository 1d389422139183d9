//! Shared application state

use deskchat_engine::ChatEngine;
use std::sync::Arc;

use crate::auth::JwtManager;
use crate::config::Config;
use crate::websocket::WebSocketState;

/// Application state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: ChatEngine,
    pub jwt: JwtManager,
    pub ws_state: WebSocketState,
}

impl AppState {
    pub fn new(config: Config, engine: ChatEngine) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.staff_token_expiry_hours);
        Self {
            config: Arc::new(config),
            engine,
            jwt,
            ws_state: WebSocketState::new(),
        }
    }
}
