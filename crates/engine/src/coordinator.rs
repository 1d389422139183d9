//! Assignment coordinator
//!
//! Moves a waiting session to `active` under the best available staff member.
//! The store's conditional assignment is the only critical section; losing a
//! race there is a normal outcome, not an error.

use deskchat_shared::{SessionId, SessionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::events::ChatEvent;
use crate::matcher::{MatchCriteria, QueueMatcher};
use crate::models::{ChatSession, StaffAvailability, StaffCandidate};
use crate::settings::RecoverySettings;
use crate::store::{AssignWrite, WaitingFilter};
use crate::timers::TimerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAssignedReason {
    /// Someone else moved the session out of `waiting` first
    AlreadyAssigned,
    NoStaff,
}

#[derive(Debug, Clone)]
pub enum AssignOutcome {
    Assigned {
        session: ChatSession,
        staff: StaffAvailability,
    },
    NotAssigned(NotAssignedReason),
}

impl AssignOutcome {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned { .. })
    }
}

/// Result of one pass over the waiting queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub assigned: usize,
    pub still_waiting: usize,
}

#[derive(Clone)]
pub struct AssignmentCoordinator {
    ctx: EngineContext,
    matcher: QueueMatcher,
}

impl AssignmentCoordinator {
    pub fn new(ctx: EngineContext, matcher: QueueMatcher) -> Self {
        Self { ctx, matcher }
    }

    pub fn matcher(&self) -> &QueueMatcher {
        &self.matcher
    }

    /// Try to assign one session
    pub async fn assign(&self, id: SessionId) -> EngineResult<AssignOutcome> {
        let session = self.ctx.load_session(id).await?;
        match session.status {
            SessionStatus::Waiting => {}
            SessionStatus::Ended => return Err(EngineError::SessionEnded(id)),
            SessionStatus::Abandoned => {
                return Err(EngineError::InvalidState(format!(
                    "session {id} is abandoned and must be recovered first"
                )))
            }
            SessionStatus::Active | SessionStatus::StaffDisconnected => {
                return Ok(AssignOutcome::NotAssigned(NotAssignedReason::AlreadyAssigned))
            }
        }

        let settings = self.ctx.settings.current().await;
        let candidates = self.candidates_for(&session, &settings).await?;

        for candidate in candidates {
            let username = candidate.staff.username.as_str();
            match self.ctx.store.conditional_assign(id, username).await? {
                AssignWrite::Assigned(assigned) => {
                    self.on_assigned(&assigned, &candidate.staff, &settings).await?;
                    return Ok(AssignOutcome::Assigned {
                        session: assigned,
                        staff: candidate.staff,
                    });
                }
                AssignWrite::SessionNotWaiting => {
                    tracing::debug!(session_id = %id, "Assignment race lost");
                    return Ok(AssignOutcome::NotAssigned(NotAssignedReason::AlreadyAssigned));
                }
                AssignWrite::StaffAtCapacity | AssignWrite::StaffUnavailable => {
                    tracing::debug!(
                        session_id = %id,
                        staff = %username,
                        "Candidate rejected on re-check, trying next"
                    );
                }
            }
        }

        tracing::debug!(session_id = %id, "No staff available, session stays queued");
        Ok(AssignOutcome::NotAssigned(NotAssignedReason::NoStaff))
    }

    async fn candidates_for(
        &self,
        session: &ChatSession,
        settings: &RecoverySettings,
    ) -> EngineResult<Vec<StaffCandidate>> {
        let criteria = MatchCriteria::for_session(session);
        let mut ranked = self.matcher.rank_candidates(&criteria).await?;

        if ranked.is_empty() && criteria.department.is_some() && settings.department_fallback {
            tracing::info!(
                session_id = %session.id,
                department = ?criteria.department,
                "No staff for department, retrying without department filter"
            );
            ranked = self
                .matcher
                .rank_candidates(&criteria.without_department())
                .await?;
        }

        if let Some(previous) = self.preferred_previous(session, settings) {
            if let Some(index) = ranked.iter().position(|c| c.staff.username == previous) {
                let candidate = ranked.remove(index);
                ranked.insert(0, candidate);
            }
        }

        Ok(ranked)
    }

    /// Previous agent to try first, when enabled and still inside the window
    fn preferred_previous<'a>(
        &self,
        session: &'a ChatSession,
        settings: &RecoverySettings,
    ) -> Option<&'a str> {
        if !settings.prefer_previous_staff {
            return None;
        }
        let requeued_at = session.requeued_at?;
        let window = Duration::seconds(i64::try_from(settings.grace_period_seconds).ok()?);
        if OffsetDateTime::now_utc() - requeued_at > window {
            return None;
        }
        session.previously_assigned_to.as_deref()
    }

    async fn on_assigned(
        &self,
        session: &ChatSession,
        staff: &StaffAvailability,
        settings: &RecoverySettings,
    ) -> EngineResult<()> {
        self.ctx.timers.cancel(session.id, TimerKind::AutoReassign);
        self.ctx.store.touch_staff_activity(&staff.username).await?;

        let guest_message = if session.previously_assigned_to.is_some() {
            self.ctx
                .system_message(session.id, &settings.reassignment_message)
                .await?;
            Some(settings.reassignment_message.clone())
        } else {
            None
        };

        tracing::info!(
            session_id = %session.id,
            staff = %staff.username,
            priority = %session.priority,
            "Chat session assigned"
        );

        self.ctx.events.emit(ChatEvent::SessionAssigned {
            session_id: session.id,
            staff_username: staff.username.clone(),
            staff_display_name: staff.display_name.clone(),
            staff_mode: staff.mode,
            guest_message,
        });
        Ok(())
    }

    /// One matcher pass over every waiting session, highest priority first
    pub async fn dispatch_waiting(&self) -> EngineResult<DispatchSummary> {
        let mut waiting = self
            .ctx
            .store
            .get_waiting_sessions(&WaitingFilter::default())
            .await?;
        waiting.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queue_position.cmp(&b.queue_position))
        });

        let mut summary = DispatchSummary::default();
        for session in waiting {
            match self.assign(session.id).await {
                Ok(AssignOutcome::Assigned { .. }) => summary.assigned += 1,
                Ok(AssignOutcome::NotAssigned(NotAssignedReason::NoStaff)) => {
                    summary.still_waiting += 1
                }
                Ok(AssignOutcome::NotAssigned(NotAssignedReason::AlreadyAssigned)) => {}
                // Ended or abandoned between the read and the attempt
                Err(e) if e.is_precondition() => {
                    tracing::debug!(session_id = %session.id, error = %e, "Skipping session");
                }
                Err(e) => return Err(e),
            }
        }

        if summary.assigned > 0 {
            self.announce_queue_positions().await?;
        }
        if summary.assigned > 0 || summary.still_waiting > 0 {
            tracing::info!(
                assigned = summary.assigned,
                still_waiting = summary.still_waiting,
                "Dispatch pass complete"
            );
        }
        Ok(summary)
    }

    /// Tell every waiting guest where they stand
    pub async fn announce_queue_positions(&self) -> EngineResult<()> {
        let settings = self.ctx.settings.current().await;
        let waiting = self
            .ctx
            .store
            .get_waiting_sessions(&WaitingFilter::default())
            .await?;
        for session in waiting {
            self.ctx.events.emit(ChatEvent::QueuePositionUpdated {
                session_id: session.id,
                queue_position: session.queue_position,
                guest_message: settings.queue_position_text(session.queue_position),
            });
        }
        Ok(())
    }
}
