//! Staff chat routes
//!
//! All routes sit behind `require_staff` and additionally need the
//! `chat.handle` permission.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use deskchat_engine::{ChatMessage, ChatSession, EndedBy, StaffAvailability, StaffPreferences};
use deskchat_shared::{SessionId, WorkMode};
use serde::Deserialize;

use crate::{
    auth::{require_permission, StaffIdentity, PERMISSION_CHAT_HANDLE},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: WorkMode,
}

#[derive(Debug, Deserialize)]
pub struct StaffMessageRequest {
    pub content: String,
}

/// Register a staff member on first sight. A deactivated account stays
/// deactivated; only an admin can bring it back.
pub(crate) async fn ensure_staff_registered(
    state: &AppState,
    staff: &StaffIdentity,
) -> ApiResult<StaffAvailability> {
    match state.engine.presence.get(&staff.username).await? {
        Some(existing) if !existing.is_active => {
            tracing::warn!(staff = %staff.username, "Deactivated staff member refused");
            Err(ApiError::Forbidden)
        }
        Some(existing) => Ok(existing),
        None => {
            let registered = state
                .engine
                .presence
                .register_staff(&staff.username, &staff.display_name)
                .await?;
            tracing::info!(staff = %staff.username, "Staff member registered for chat");
            Ok(registered)
        }
    }
}

async fn authorize(state: &AppState, staff: &StaffIdentity) -> ApiResult<()> {
    require_permission(staff, PERMISSION_CHAT_HANDLE)?;
    ensure_staff_registered(state, staff).await?;
    Ok(())
}

/// The caller's availability row
pub async fn me(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
) -> ApiResult<Json<StaffAvailability>> {
    require_permission(&staff, PERMISSION_CHAT_HANDLE)?;
    let availability = ensure_staff_registered(&state, &staff).await?;
    Ok(Json(availability))
}

pub async fn set_mode(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Json(req): Json<SetModeRequest>,
) -> ApiResult<Json<StaffAvailability>> {
    authorize(&state, &staff).await?;
    let availability = state.engine.presence.set_mode(&staff.username, req.mode).await?;
    Ok(Json(availability))
}

pub async fn update_preferences(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Json(preferences): Json<StaffPreferences>,
) -> ApiResult<Json<StaffAvailability>> {
    authorize(&state, &staff).await?;
    let availability = state
        .engine
        .presence
        .update_preferences(&staff.username, preferences)
        .await?;
    Ok(Json(availability))
}

pub async fn post_message(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<StaffMessageRequest>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    authorize(&state, &staff).await?;
    let message = state
        .engine
        .sessions
        .post_staff_message(session_id, &staff.username, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn end_session(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<ChatSession>> {
    authorize(&state, &staff).await?;
    let session = state
        .engine
        .sessions
        .end_session(session_id, EndedBy::Staff(staff.username.clone()))
        .await?;
    Ok(Json(session))
}
