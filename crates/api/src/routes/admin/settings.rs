//! Recovery settings document

use axum::{
    extract::{Extension, State},
    Json,
};
use deskchat_engine::RecoverySettings;

use super::shared::require_admin;
use crate::{auth::StaffIdentity, error::ApiResult, state::AppState};

pub async fn get_recovery_settings(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
) -> ApiResult<Json<RecoverySettings>> {
    require_admin(&staff)?;
    let settings = state.engine.settings().current().await;
    Ok(Json(settings.as_ref().clone()))
}

/// Replace the settings document. Omitted fields take their defaults.
pub async fn update_recovery_settings(
    State(state): State<AppState>,
    Extension(staff): Extension<StaffIdentity>,
    Json(settings): Json<RecoverySettings>,
) -> ApiResult<Json<RecoverySettings>> {
    require_admin(&staff)?;
    let updated = state.engine.settings().update(settings).await?;
    tracing::info!(admin = %staff.username, "Recovery settings updated");
    Ok(Json(updated.as_ref().clone()))
}
