//! Session recovery lookup
//!
//! Lets a returning guest re-attach to their prior session, either by
//! name and email within a search window or by the session's recovery token.

use deskchat_shared::SessionStatus;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::context::{EngineContext, Transition};
use crate::coordinator::AssignmentCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::events::ChatEvent;
use crate::models::{ChatMessage, ChatSession};
use crate::store::QueuePlacement;
use crate::supervisor::RecoverySupervisor;
use crate::timers::TimerKind;

/// Queue slot for a recovered abandoned session
const ABANDONED_REENTRY: i32 = 1;
/// Queue slot for a recovered staff-disconnected session
const DISCONNECTED_REENTRY: i32 = 2;
const MAX_SEARCH_WINDOW_HOURS: u32 = 168;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredSession {
    pub session: ChatSession,
    pub message_history: Vec<ChatMessage>,
}

/// Where a recovered session re-enters, or `None` to leave it as is
fn reentry_placement(status: SessionStatus) -> Option<QueuePlacement> {
    match status {
        SessionStatus::Abandoned => Some(QueuePlacement::At(ABANDONED_REENTRY)),
        SessionStatus::StaffDisconnected => Some(QueuePlacement::At(DISCONNECTED_REENTRY)),
        // An active session stays with its agent; the guest just rejoins
        SessionStatus::Waiting | SessionStatus::Active => Some(QueuePlacement::Unchanged),
        SessionStatus::Ended => None,
    }
}

fn gap_message(gap: Duration) -> String {
    let minutes = gap.whole_minutes().max(0);
    let unit = if minutes == 1 { "minute" } else { "minutes" };
    format!("Guest reconnected after {minutes} {unit}")
}

#[derive(Clone)]
pub struct SessionRecovery {
    ctx: EngineContext,
    coordinator: AssignmentCoordinator,
    supervisor: RecoverySupervisor,
}

impl SessionRecovery {
    pub fn new(
        ctx: EngineContext,
        coordinator: AssignmentCoordinator,
        supervisor: RecoverySupervisor,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            supervisor,
        }
    }

    /// Find and recover the guest's most recent session. `None` means start a
    /// fresh session.
    pub async fn reconnect(
        &self,
        guest_name: &str,
        guest_email: &str,
        search_window_hours: Option<u32>,
    ) -> EngineResult<Option<RecoveredSession>> {
        let guest_name = guest_name.trim();
        let guest_email = guest_email.trim();
        if guest_name.is_empty() || guest_email.is_empty() {
            return Err(EngineError::InvalidInput(
                "guest name and email are required".to_string(),
            ));
        }

        let hours = match search_window_hours {
            Some(hours) => hours,
            None => self.ctx.settings.current().await.default_recovery_window_hours,
        };
        if !(1..=MAX_SEARCH_WINDOW_HOURS).contains(&hours) {
            return Err(EngineError::InvalidInput(format!(
                "search window must be between 1 and {MAX_SEARCH_WINDOW_HOURS} hours"
            )));
        }

        let since = OffsetDateTime::now_utc() - Duration::hours(i64::from(hours));
        let found = self
            .ctx
            .store
            .find_recoverable_session(guest_name, guest_email, since)
            .await?;

        match found {
            Some(session) => self.recover(session).await.map(Some),
            None => {
                tracing::debug!(window_hours = hours, "No recoverable session for guest");
                Ok(None)
            }
        }
    }

    /// Same recovery addressed by the secret token, without a search window
    pub async fn resume_by_token(&self, recovery_token: &str) -> EngineResult<Option<RecoveredSession>> {
        let Some(session) = self.ctx.store.get_session_by_token(recovery_token).await? else {
            return Ok(None);
        };
        if session.status == SessionStatus::Ended {
            return Err(EngineError::SessionEnded(session.id));
        }
        self.recover(session).await.map(Some)
    }

    async fn recover(&self, found: ChatSession) -> EngineResult<RecoveredSession> {
        let id = found.id;
        let now = OffsetDateTime::now_utc();
        let mut previous_status = found.status;

        let transition = self
            .ctx
            .transition(id, |s| {
                let placement = reentry_placement(s.status).ok_or(EngineError::SessionEnded(s.id))?;
                previous_status = s.status;
                s.recovery_attempts += 1;
                match s.status {
                    SessionStatus::Abandoned => {
                        s.status = SessionStatus::Waiting;
                        s.requeued_at = Some(now);
                    }
                    SessionStatus::StaffDisconnected => {
                        s.previously_assigned_to = s.assigned_to.take();
                        s.status = SessionStatus::Waiting;
                        s.assigned_at = None;
                        s.disconnected_at = None;
                        s.requeued_at = Some(now);
                    }
                    // Waiting keeps its slot. Active is not sent back to the
                    // queue: the guest reattaches to the staff member already
                    // serving them.
                    SessionStatus::Waiting | SessionStatus::Active | SessionStatus::Ended => {}
                }
                Ok(Some(placement))
            })
            .await?;

        let session = match transition {
            Transition::Applied(session) | Transition::Skipped(session) => session,
        };

        if previous_status == SessionStatus::StaffDisconnected {
            self.ctx.timers.cancel(id, TimerKind::GracePeriod);
        }

        self.ctx
            .system_message(id, &gap_message(now - found.last_guest_activity_at))
            .await?;
        self.supervisor.record_guest_activity(id).await?;

        tracing::info!(
            session_id = %id,
            from = %previous_status,
            attempts = session.recovery_attempts,
            "Guest session recovered"
        );

        let message_history = self.ctx.store.list_messages(id).await?;
        self.ctx.events.emit(ChatEvent::SessionRecovered {
            session_id: id,
            message_history: message_history.clone(),
        });

        if session.status == SessionStatus::Waiting {
            match self.coordinator.assign(id).await {
                Ok(_) => self.coordinator.announce_queue_positions().await?,
                Err(e) if e.is_precondition() => {}
                Err(e) => return Err(e),
            }
        }

        let session = self.ctx.load_session(id).await?;
        Ok(RecoveredSession {
            session,
            message_history,
        })
    }
}
