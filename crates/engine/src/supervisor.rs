//! Disconnect and recovery supervisor
//!
//! Per assignment state machine:
//!
//! ```text
//! active --staff lost--> staff_disconnected --same staff back--> active
//!                               |
//!                               +--grace timer--> waiting (requeued, maybe escalated)
//! waiting | active --no guest activity--> abandoned
//! ```
//!
//! Every handler re-reads the session and acts only if it is still in the
//! state that armed it, so stale or duplicated signals are no-ops. Writes go
//! through the version-checked transition, so a retried handler never applies
//! its effects twice.

use deskchat_shared::{ChatPriority, RequeuePolicy, SessionId, SessionStatus};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::context::{EngineContext, Transition};
use crate::coordinator::{AssignOutcome, AssignmentCoordinator, NotAssignedReason};
use crate::error::{EngineError, EngineResult};
use crate::events::ChatEvent;
use crate::models::ChatSession;
use crate::settings::RecoverySettings;
use crate::store::{QueuePlacement, StaffAvailabilityUpdate, WaitingFilter};
use crate::timers::TimerKind;

const TIMER_RETRY_BASE_MS: u64 = 100;
const TIMER_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const TIMER_MAX_RETRIES: usize = 5;
/// Floor for a re-armed inactivity check, so a lapsed deadline cannot spin
const MIN_INACTIVITY_RECHECK: Duration = Duration::from_secs(1);

/// Apply the configured requeue policy to a session leaving an assignment.
/// Returns where it re-enters the queue.
pub fn apply_requeue_policy(session: &mut ChatSession, settings: &RecoverySettings) -> QueuePlacement {
    match settings.requeue_position {
        RequeuePolicy::Front => QueuePlacement::Front,
        RequeuePolicy::PriorityBoost => {
            session.priority = session.priority.boosted(settings.priority_boost_amount);
            QueuePlacement::End
        }
        RequeuePolicy::Original => session
            .original_queue_position
            .map_or(QueuePlacement::End, QueuePlacement::At),
        RequeuePolicy::End => QueuePlacement::End,
    }
}

/// Force escalation once the disconnect threshold is reached. Overrides any
/// boost from the requeue policy but never lowers an already higher priority.
pub fn apply_escalation(
    session: &mut ChatSession,
    priority_before: ChatPriority,
    settings: &RecoverySettings,
) -> bool {
    if session.staff_disconnect_count < settings.max_disconnects_before_escalation {
        return false;
    }
    session.priority = priority_before.max(settings.escalation_priority);
    session.is_escalated = true;
    true
}

#[derive(Clone)]
pub struct RecoverySupervisor {
    ctx: EngineContext,
    coordinator: AssignmentCoordinator,
}

impl RecoverySupervisor {
    pub fn new(ctx: EngineContext, coordinator: AssignmentCoordinator) -> Self {
        Self { ctx, coordinator }
    }

    // =========================================================================
    // Staff connection loss and return
    // =========================================================================

    /// Transport lost the staff member's last connection. Every active
    /// session they hold enters the grace window. Returns how many did.
    pub async fn staff_disconnected(&self, username: &str) -> EngineResult<usize> {
        if self.ctx.store.get_staff(username).await?.is_none() {
            return Err(EngineError::StaffNotFound(username.to_string()));
        }
        self.ctx
            .store
            .upsert_staff_availability(
                username,
                &StaffAvailabilityUpdate {
                    is_online: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        let mut entered = 0;
        let active = self
            .ctx
            .store
            .get_staff_sessions(username, SessionStatus::Active)
            .await?;
        let waiting_on_staff = self
            .ctx
            .store
            .get_staff_sessions(username, SessionStatus::StaffDisconnected)
            .await?;
        for session in active.iter().chain(waiting_on_staff.iter()) {
            if self.begin_grace(session.id, username).await? {
                entered += 1;
            }
        }

        tracing::info!(staff = %username, sessions = entered, "Staff disconnected");
        Ok(entered)
    }

    /// Move one session into the grace window. A duplicate signal for a
    /// session already waiting on the same staff member changes nothing.
    pub async fn begin_grace(&self, id: SessionId, username: &str) -> EngineResult<bool> {
        let grace = self.ctx.settings.current().await.staff_disconnect_timeout();
        let now = OffsetDateTime::now_utc();
        let transition = self
            .ctx
            .transition(id, |s| {
                if s.status != SessionStatus::Active || !s.is_assigned_to(username) {
                    return Ok(None);
                }
                s.status = SessionStatus::StaffDisconnected;
                s.disconnected_at = Some(now);
                Ok(Some(QueuePlacement::Unchanged))
            })
            .await?;

        match transition {
            Transition::Applied(session) => {
                tracing::info!(
                    session_id = %id,
                    staff = %username,
                    "Assigned staff lost, grace period started"
                );
                // Stamp with the stored value; the database rounds timestamps
                let since = session.disconnected_at.unwrap_or(now);
                self.arm_grace(session.id, since, grace);
                Ok(true)
            }
            Transition::Skipped(session) => {
                // Re-arm only if missing, e.g. after a process restart
                if let (SessionStatus::StaffDisconnected, Some(since)) =
                    (session.status, session.disconnected_at)
                {
                    if session.is_assigned_to(username) {
                        self.arm_grace(session.id, since, grace);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Staff member is back. Resumes their grace-waiting sessions and runs a
    /// dispatch pass for the regained capacity.
    pub async fn staff_reconnected(&self, username: &str) -> EngineResult<Vec<SessionId>> {
        if self.ctx.store.get_staff(username).await?.is_none() {
            return Err(EngineError::StaffNotFound(username.to_string()));
        }
        self.ctx
            .store
            .upsert_staff_availability(
                username,
                &StaffAvailabilityUpdate {
                    is_online: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        self.ctx.store.touch_staff_activity(username).await?;

        let mut resumed = Vec::new();
        let sessions = self
            .ctx
            .store
            .get_staff_sessions(username, SessionStatus::StaffDisconnected)
            .await?;
        for session in sessions {
            let transition = self
                .ctx
                .transition(session.id, |s| {
                    if s.status != SessionStatus::StaffDisconnected || !s.is_assigned_to(username) {
                        return Ok(None);
                    }
                    s.status = SessionStatus::Active;
                    s.disconnected_at = None;
                    Ok(Some(QueuePlacement::Unchanged))
                })
                .await?;

            if let Transition::Applied(session) = transition {
                self.ctx.timers.cancel(session.id, TimerKind::GracePeriod);
                tracing::info!(session_id = %session.id, staff = %username, "Session resumed");
                self.ctx.events.emit(ChatEvent::SessionResumed {
                    session_id: session.id,
                    staff_username: username.to_string(),
                });
                resumed.push(session.id);
            }
        }

        self.coordinator.dispatch_waiting().await?;
        Ok(resumed)
    }

    // =========================================================================
    // Grace expiry: requeue and escalation
    // =========================================================================

    /// Grace window elapsed without the staff member returning. `since` is the
    /// `disconnected_at` the timer was armed for; a session that resumed and
    /// lost its staff member again carries a newer stamp and is left alone.
    /// Returns the requeued session, or `None` if the timer was stale.
    pub async fn handle_grace_expired(
        &self,
        id: SessionId,
        since: Option<OffsetDateTime>,
    ) -> EngineResult<Option<ChatSession>> {
        let settings = self.ctx.settings.current().await;
        let now = OffsetDateTime::now_utc();

        let transition = self
            .ctx
            .transition(id, |s| {
                if s.status != SessionStatus::StaffDisconnected {
                    return Ok(None);
                }
                if since.is_some_and(|since| s.disconnected_at != Some(since)) {
                    return Ok(None);
                }
                let priority_before = s.priority;
                s.staff_disconnect_count += 1;
                s.previously_assigned_to = s.assigned_to.take();
                s.status = SessionStatus::Waiting;
                s.assigned_at = None;
                s.disconnected_at = None;
                s.requeued_at = Some(now);

                let placement = apply_requeue_policy(s, &settings);
                apply_escalation(s, priority_before, &settings);
                Ok(Some(placement))
            })
            .await?;

        let session = match transition {
            Transition::Applied(session) => session,
            Transition::Skipped(session) => {
                tracing::debug!(
                    session_id = %id,
                    status = %session.status,
                    "Stale grace timer ignored"
                );
                return Ok(None);
            }
        };

        tracing::info!(
            session_id = %id,
            previous_staff = ?session.previously_assigned_to,
            disconnects = session.staff_disconnect_count,
            priority = %session.priority,
            queue_position = session.queue_position,
            policy = settings.requeue_position.as_str(),
            "Session requeued after staff disconnect"
        );

        self.ctx
            .system_message(id, &settings.staff_disconnect_message)
            .await?;

        if session.staff_disconnect_count >= settings.max_disconnects_before_escalation {
            tracing::warn!(
                session_id = %id,
                disconnects = session.staff_disconnect_count,
                priority = %session.priority,
                "Session escalated"
            );
            self.ctx.events.emit(ChatEvent::SessionEscalated {
                session_id: id,
                priority: session.priority,
            });
        }

        self.ctx.events.emit(ChatEvent::SessionRequeued {
            session_id: id,
            new_priority: session.priority,
            new_queue_position: session.queue_position,
            guest_message: settings.staff_disconnect_message.clone(),
        });

        self.arm_auto_reassign(id, settings.auto_reassign_after());
        self.assign_or_announce(id).await?;
        Ok(Some(session))
    }

    /// Forced matcher pass for a requeued session nobody picked up
    pub async fn handle_auto_reassign(&self, id: SessionId) -> EngineResult<()> {
        let session = self.ctx.load_session(id).await?;
        if session.status != SessionStatus::Waiting {
            tracing::debug!(session_id = %id, status = %session.status, "Stale auto-reassign timer ignored");
            return Ok(());
        }

        tracing::info!(session_id = %id, "Auto-reassign pass");
        let outcome = self.assign_or_announce(id).await?;
        if matches!(outcome, Some(AssignOutcome::NotAssigned(NotAssignedReason::NoStaff))) {
            let settings = self.ctx.settings.current().await;
            self.arm_auto_reassign(id, settings.auto_reassign_after());
        }
        Ok(())
    }

    /// Attempt assignment; if the session stays queued, refresh every waiting
    /// guest's position
    async fn assign_or_announce(&self, id: SessionId) -> EngineResult<Option<AssignOutcome>> {
        let outcome = match self.coordinator.assign(id).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_precondition() => None,
            Err(e) => return Err(e),
        };
        self.coordinator.announce_queue_positions().await?;
        Ok(outcome)
    }

    // =========================================================================
    // Guest inactivity
    // =========================================================================

    /// Record guest activity and restart the inactivity timer
    pub async fn record_guest_activity(&self, id: SessionId) -> EngineResult<()> {
        let seen = self
            .ctx
            .store
            .touch_guest_activity(id)
            .await?
            .ok_or(EngineError::SessionNotFound(id))?;
        let settings = self.ctx.settings.current().await;
        self.arm_inactivity(id, seen, settings.guest_inactivity_timeout());
        Ok(())
    }

    /// Abandon a silent session. `seen` is the activity timestamp observed
    /// when the check was armed; newer activity re-arms instead.
    pub async fn handle_guest_inactivity(
        &self,
        id: SessionId,
        seen: Option<OffsetDateTime>,
    ) -> EngineResult<bool> {
        let mut was_active = false;
        let transition = self
            .ctx
            .transition(id, |s| {
                if !matches!(s.status, SessionStatus::Waiting | SessionStatus::Active) {
                    return Ok(None);
                }
                if seen.is_some_and(|seen| s.last_guest_activity_at > seen) {
                    return Ok(None);
                }
                was_active = s.status == SessionStatus::Active;
                if let Some(staff) = s.assigned_to.take() {
                    s.previously_assigned_to = Some(staff);
                }
                s.status = SessionStatus::Abandoned;
                Ok(Some(QueuePlacement::Unchanged))
            })
            .await?;

        let session = match transition {
            Transition::Applied(session) => session,
            Transition::Skipped(session) => {
                self.rewatch_guest(&session).await;
                return Ok(false);
            }
        };

        self.ctx.timers.cancel_all(id);
        tracing::info!(
            session_id = %id,
            previous_staff = ?session.previously_assigned_to,
            "Session abandoned after guest inactivity"
        );
        self.ctx
            .events
            .emit(ChatEvent::SessionAbandoned { session_id: id });

        if was_active {
            self.coordinator.dispatch_waiting().await?;
        } else {
            self.coordinator.announce_queue_positions().await?;
        }
        Ok(true)
    }

    /// Keep watching a session whose inactivity check was skipped. A session
    /// waiting on its staff member is checked again no earlier than the end
    /// of its grace window, when it is either active or requeued.
    async fn rewatch_guest(&self, session: &ChatSession) {
        let settings = self.ctx.settings.current().await;
        let now = OffsetDateTime::now_utc();
        let idle = now - session.last_guest_activity_at;
        let remaining = settings
            .guest_inactivity_timeout()
            .saturating_sub(idle.try_into().unwrap_or_default());

        let delay = match session.status {
            SessionStatus::Waiting | SessionStatus::Active => remaining,
            SessionStatus::StaffDisconnected => {
                let grace_left = session.disconnected_at.map_or(Duration::ZERO, |since| {
                    settings
                        .staff_disconnect_timeout()
                        .saturating_sub((now - since).try_into().unwrap_or_default())
                });
                remaining.max(grace_left)
            }
            SessionStatus::Abandoned | SessionStatus::Ended => return,
        };
        self.arm_inactivity(
            session.id,
            session.last_guest_activity_at,
            delay.max(MIN_INACTIVITY_RECHECK),
        );
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// `since` stamps the timer with the disconnect it belongs to
    fn arm_grace(&self, id: SessionId, since: OffsetDateTime, delay: Duration) {
        let supervisor = self.clone();
        self.ctx
            .timers
            .schedule_if_absent(id, TimerKind::GracePeriod, delay, move || async move {
                supervisor
                    .run_timer(id, TimerKind::GracePeriod, Some(since))
                    .await
            });
    }

    fn arm_auto_reassign(&self, id: SessionId, delay: Duration) {
        let supervisor = self.clone();
        self.ctx
            .timers
            .schedule(id, TimerKind::AutoReassign, delay, move || async move {
                supervisor.run_timer(id, TimerKind::AutoReassign, None).await
            });
    }

    fn arm_inactivity(&self, id: SessionId, seen: OffsetDateTime, delay: Duration) {
        let supervisor = self.clone();
        self.ctx
            .timers
            .schedule(id, TimerKind::GuestInactivity, delay, move || async move {
                supervisor
                    .run_timer(id, TimerKind::GuestInactivity, Some(seen))
                    .await
            });
    }

    /// Arm the inactivity timer for a session that has not seen activity yet
    pub(crate) fn watch_guest(&self, session: &ChatSession, settings: &RecoverySettings) {
        self.arm_inactivity(
            session.id,
            session.last_guest_activity_at,
            settings.guest_inactivity_timeout(),
        );
    }

    /// `stamp` is the state the timer was armed against: the disconnect time
    /// for grace, the last guest activity for inactivity
    async fn fire(
        &self,
        id: SessionId,
        kind: TimerKind,
        stamp: Option<OffsetDateTime>,
    ) -> EngineResult<()> {
        match kind {
            TimerKind::GracePeriod => self.handle_grace_expired(id, stamp).await.map(|_| ()),
            TimerKind::AutoReassign => self.handle_auto_reassign(id).await,
            TimerKind::GuestInactivity => self.handle_guest_inactivity(id, stamp).await.map(|_| ()),
        }
    }

    /// Run a timer handler, retrying infrastructure failures with backoff
    async fn run_timer(&self, id: SessionId, kind: TimerKind, stamp: Option<OffsetDateTime>) {
        let strategy = ExponentialBackoff::from_millis(TIMER_RETRY_BASE_MS)
            .max_delay(TIMER_RETRY_MAX_DELAY)
            .take(TIMER_MAX_RETRIES)
            .map(jitter);

        let result = Retry::spawn(strategy, || async move {
            match self.fire(id, kind, stamp).await {
                Ok(()) => Ok(Ok(())),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        session_id = %id,
                        timer = kind.as_str(),
                        error = %e,
                        "Timer handler failed, will retry"
                    );
                    Err(e)
                }
                Err(e) => Ok(Err(e)),
            }
        })
        .await
        .unwrap_or_else(Err);

        if let Err(e) = result {
            tracing::error!(
                session_id = %id,
                timer = kind.as_str(),
                error = %e,
                "Timer handler failed"
            );
        }
    }

    // =========================================================================
    // Backstop sweeps
    // =========================================================================

    /// Requeue grace-waiting sessions whose timer was lost
    pub async fn sweep_expired_grace(&self, now: OffsetDateTime) -> EngineResult<usize> {
        let settings = self.ctx.settings.current().await;
        let expired = self
            .ctx
            .store
            .find_expired_grace_sessions(now - settings.staff_disconnect_timeout())
            .await?;

        let mut requeued = 0;
        for session in expired {
            match self.handle_grace_expired(session.id, session.disconnected_at).await {
                Ok(Some(_)) => requeued += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "Grace sweep failed for session")
                }
            }
        }
        Ok(requeued)
    }

    /// Matcher pass over requeued sessions waiting past the auto-reassign delay
    pub async fn sweep_stale_requeued(&self, now: OffsetDateTime) -> EngineResult<usize> {
        let settings = self.ctx.settings.current().await;
        let stale = self
            .ctx
            .store
            .get_waiting_sessions(&WaitingFilter {
                requeued_before: Some(now - settings.auto_reassign_after()),
                ..Default::default()
            })
            .await?;

        let mut assigned = 0;
        for session in stale {
            match self.coordinator.assign(session.id).await {
                Ok(outcome) if outcome.is_assigned() => assigned += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "Auto-reassign sweep failed for session")
                }
            }
        }
        if assigned > 0 {
            self.coordinator.announce_queue_positions().await?;
        }
        Ok(assigned)
    }

    /// Abandon sessions whose inactivity timer was lost
    pub async fn sweep_inactive(&self, now: OffsetDateTime) -> EngineResult<usize> {
        let settings = self.ctx.settings.current().await;
        let idle = self
            .ctx
            .store
            .find_inactive_sessions(now - settings.guest_inactivity_timeout())
            .await?;

        let mut abandoned = 0;
        for session in idle {
            match self
                .handle_guest_inactivity(session.id, Some(session.last_guest_activity_at))
                .await
            {
                Ok(true) => abandoned += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "Inactivity sweep failed for session")
                }
            }
        }
        Ok(abandoned)
    }
}
