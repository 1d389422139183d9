//! Staff account management

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use deskchat_engine::StaffAvailability;

use super::shared::{require_admin, require_supervisor};
use crate::{
    auth::StaffIdentity,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn get_staff(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Path(username): Path<String>,
) -> ApiResult<Json<StaffAvailability>> {
    require_supervisor(&staff)?;
    let availability = state
        .engine
        .presence
        .get(&username)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(availability))
}

/// Take a staff member out of chat routing; their chats go back to the queue
pub async fn deactivate_staff(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Path(username): Path<String>,
) -> ApiResult<Json<StaffAvailability>> {
    require_admin(&staff)?;
    let availability = state.engine.presence.deactivate(&username).await?;
    tracing::info!(staff = %username, admin = %staff.username, "Staff deactivated by admin");
    Ok(Json(availability))
}

/// Re-enable a deactivated staff member
pub async fn reactivate_staff(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Path(username): Path<String>,
) -> ApiResult<Json<StaffAvailability>> {
    require_admin(&staff)?;
    let existing = state
        .engine
        .presence
        .get(&username)
        .await?
        .ok_or(ApiError::NotFound)?;
    let availability = state
        .engine
        .presence
        .register_staff(&username, &existing.display_name)
        .await?;
    tracing::info!(staff = %username, admin = %staff.username, "Staff reactivated by admin");
    Ok(Json(availability))
}
