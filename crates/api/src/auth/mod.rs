//! Staff authentication for deskchat
//!
//! Guests never carry a token here; they address their own session with its
//! recovery token instead.

pub mod jwt;
pub mod middleware;

pub use jwt::{
    JwtError, JwtManager, StaffClaims, StaffIdentity, PERMISSION_CHAT_ADMIN,
    PERMISSION_CHAT_HANDLE, PERMISSION_CHAT_SUPERVISE,
};
pub use middleware::{require_permission, require_staff};
