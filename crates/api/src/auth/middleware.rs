//! Staff authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use super::jwt::StaffIdentity;
use crate::error::ApiError;
use crate::state::AppState;

/// Pull the bearer token out of an `Authorization` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Require a valid staff token; inserts [`StaffIdentity`] as a request extension
pub async fn require_staff(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?;

    let identity = state.jwt.validate_staff_token(token).map_err(|e| {
        tracing::debug!(error = %e, "Staff token rejected");
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Reject the request unless the staff member holds `permission`
pub fn require_permission(staff: &StaffIdentity, permission: &str) -> Result<(), ApiError> {
    if staff.has_permission(permission) {
        Ok(())
    } else {
        tracing::warn!(staff = %staff.username, permission, "Permission denied");
        Err(ApiError::Forbidden)
    }
}
