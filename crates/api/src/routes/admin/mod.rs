//! Chat supervision and administration routes
//!
//! - `sessions`: escalated pool, disconnect-history reset, manual dispatch
//! - `settings`: recovery settings document
//! - `staff`: staff account management
//! - `shared`: permission helpers used by the sub-modules

pub mod sessions;
pub mod settings;
pub mod shared;
pub mod staff;
