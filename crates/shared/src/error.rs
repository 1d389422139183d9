//! Error types for deskchat

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeskError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
