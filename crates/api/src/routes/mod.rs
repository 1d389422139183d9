//! API routes

pub mod admin;
pub mod chat;
pub mod health;
pub mod staff;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::require_staff,
    state::AppState,
    websocket::{guest_ws_handler, staff_ws_handler},
};

/// Chat messages are short; anything past this is rejected before parsing
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Guest routes (authorized per session by recovery token)
    let guest_routes = Router::new()
        .route("/chat/sessions", post(chat::start_session))
        .route("/chat/sessions/:session_id", get(chat::get_session))
        .route(
            "/chat/sessions/:session_id/messages",
            get(chat::list_messages).post(chat::post_message),
        )
        .route("/chat/sessions/:session_id/end", post(chat::end_session))
        .route("/chat/recover", post(chat::recover_session))
        .route("/chat/resume", post(chat::resume_session));

    // Staff routes (Bearer JWT)
    let staff_routes = Router::new()
        .route("/staff/me", get(staff::me))
        .route("/staff/mode", put(staff::set_mode))
        .route("/staff/preferences", put(staff::update_preferences))
        .route("/staff/sessions/:session_id/messages", post(staff::post_message))
        .route("/staff/sessions/:session_id/end", post(staff::end_session))
        // Supervisor and admin routes (permission check inside handlers)
        .route("/admin/sessions/escalated", get(admin::sessions::list_escalated))
        .route("/admin/sessions/:session_id/reset", post(admin::sessions::reset_session))
        .route("/admin/dispatch", post(admin::sessions::dispatch))
        .route(
            "/admin/recovery-settings",
            get(admin::settings::get_recovery_settings).put(admin::settings::update_recovery_settings),
        )
        .route("/admin/staff/:username", get(admin::staff::get_staff))
        .route("/admin/staff/:username/deactivate", post(admin::staff::deactivate_staff))
        .route("/admin/staff/:username/reactivate", post(admin::staff::reactivate_staff))
        .layer(middleware::from_fn_with_state(state.clone(), require_staff));

    // WebSocket routes (auth handled in handler via query parameter)
    let websocket_routes = Router::new()
        .route("/ws/staff", get(staff_ws_handler))
        .route("/ws/guest", get(guest_ws_handler));

    let api_routes = Router::new().merge(guest_routes).merge(staff_routes);

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(cors_layer(state.config.cors_allowed_origin.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match allowed_origin.map(HeaderValue::from_str) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Ignoring malformed CORS_ALLOWED_ORIGIN, allowing any origin");
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}
