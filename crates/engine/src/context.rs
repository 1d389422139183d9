//! Shared handles passed to every engine component

use deskchat_shared::{MessageSender, SessionId};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::events::EventEmitter;
use crate::models::ChatSession;
use crate::settings::RecoverySettingsCache;
use crate::store::{ChatStore, QueuePlacement};
use crate::timers::SessionTimers;

/// Version-conflict retries before a transition gives up
const MAX_TRANSITION_ATTEMPTS: usize = 8;

/// Result of a compare-and-swap transition
#[derive(Debug)]
pub enum Transition {
    Applied(ChatSession),
    /// The closure found nothing to do; carries the session as read
    Skipped(ChatSession),
}

#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn ChatStore>,
    pub settings: Arc<RecoverySettingsCache>,
    pub events: EventEmitter,
    pub timers: SessionTimers,
}

impl EngineContext {
    pub async fn load_session(&self, id: SessionId) -> EngineResult<ChatSession> {
        self.store
            .get_session(id)
            .await?
            .ok_or(EngineError::SessionNotFound(id))
    }

    /// Read-modify-write a session under its version column.
    ///
    /// `apply` mutates a fresh copy and returns the queue placement to write
    /// with, or `None` to leave the row untouched. On a version conflict the
    /// row is re-read and `apply` runs again against the new state.
    pub async fn transition<F>(&self, id: SessionId, mut apply: F) -> EngineResult<Transition>
    where
        F: FnMut(&mut ChatSession) -> EngineResult<Option<QueuePlacement>> + Send,
    {
        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let current = self.load_session(id).await?;
            let mut next = current.clone();

            let Some(placement) = apply(&mut next)? else {
                return Ok(Transition::Skipped(current));
            };

            match self
                .store
                .update_session(&next, current.version, placement)
                .await?
            {
                Some(written) => return Ok(Transition::Applied(written)),
                None => {
                    tracing::debug!(session_id = %id, attempt, "Session version conflict, retrying");
                }
            }
        }

        tracing::error!(session_id = %id, "Session transition did not settle");
        Err(EngineError::Contention(id))
    }

    pub async fn system_message(&self, id: SessionId, text: &str) -> EngineResult<()> {
        self.store
            .append_message(id, MessageSender::System, None, text)
            .await?;
        Ok(())
    }
}
