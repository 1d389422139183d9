//! Chat engine error types

use deskchat_shared::{DeskError, SessionId};
use thiserror::Error;

/// Engine-specific errors
///
/// Contention losses and "nothing available" outcomes are not errors; they are
/// reported through the operation's return value. What remains here is either a
/// rejected precondition or an infrastructure failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Chat session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Staff member not found: {0}")]
    StaffNotFound(String),

    #[error("Chat session {0} has already ended")]
    SessionEnded(SessionId),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid recovery settings: {0}")]
    InvalidSettings(String),

    #[error("Concurrent updates to session {0} did not settle")]
    Contention(SessionId),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Infrastructure failures the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Contention(_))
    }

    /// Operation rejected because the session is not in a state that allows it
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::SessionEnded(_) | Self::InvalidState(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        EngineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidSettings(err.to_string())
    }
}

impl From<DeskError> for EngineError {
    fn from(err: DeskError) -> Self {
        match err {
            DeskError::Validation(msg) => EngineError::InvalidInput(msg),
            DeskError::NotFound(msg) => EngineError::InvalidInput(msg),
            DeskError::Internal(msg) => EngineError::Internal(msg),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
