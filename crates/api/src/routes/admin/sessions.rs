//! Escalated sessions and queue control

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use deskchat_engine::{ChatSession, DispatchSummary};
use deskchat_shared::SessionId;

use super::shared::{require_admin, require_supervisor};
use crate::{auth::StaffIdentity, error::ApiResult, state::AppState};

/// Sessions that hit the disconnect threshold, for supervisors
pub async fn list_escalated(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
) -> ApiResult<Json<Vec<ChatSession>>> {
    require_supervisor(&staff)?;
    let sessions = state.engine.sessions.list_escalated().await?;
    Ok(Json(sessions))
}

/// Clear a session's disconnect history, escalation flag and priority
pub async fn reset_session(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<ChatSession>> {
    require_admin(&staff)?;
    let session = state.engine.sessions.admin_reset(session_id).await?;
    tracing::info!(session_id = %session_id, admin = %staff.username, "Admin reset chat session");
    Ok(Json(session))
}

/// Run one assignment pass over the waiting queue
pub async fn dispatch(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
) -> ApiResult<Json<DispatchSummary>> {
    require_supervisor(&staff)?;
    let summary = state.engine.coordinator.dispatch_waiting().await?;
    Ok(Json(summary))
}
