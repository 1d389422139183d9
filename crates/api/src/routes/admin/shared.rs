//! Shared helpers for admin routes

use crate::{
    auth::{require_permission, StaffIdentity, PERMISSION_CHAT_ADMIN, PERMISSION_CHAT_SUPERVISE},
    error::{ApiError, ApiResult},
};

/// Admins see everything supervisors see
pub fn require_supervisor(staff: &StaffIdentity) -> ApiResult<()> {
    if staff.has_permission(PERMISSION_CHAT_SUPERVISE) || staff.has_permission(PERMISSION_CHAT_ADMIN) {
        Ok(())
    } else {
        tracing::warn!(staff = %staff.username, "Supervisor route refused");
        Err(ApiError::Forbidden)
    }
}

pub fn require_admin(staff: &StaffIdentity) -> ApiResult<()> {
    require_permission(staff, PERMISSION_CHAT_ADMIN)
}
