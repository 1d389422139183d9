//! In-memory chat store
//!
//! Used by tests and local development without a database. A single write
//! lock around the whole state makes every operation atomic, which satisfies
//! the conditional-assign and compare-and-swap guarantees trivially.

use async_trait::async_trait;
use deskchat_shared::{MessageSender, SessionId, SessionStatus, WorkMode};
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AssignWrite, ChatStore, QueuePlacement, StaffAvailabilityUpdate, WaitingFilter};
use crate::error::{EngineError, EngineResult};
use crate::models::{ChatMessage, ChatSession, NewSession, StaffAvailability, StaffCandidate};
use crate::settings::RecoverySettings;

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, ChatSession>,
    staff: HashMap<String, StaffAvailability>,
    messages: HashMap<SessionId, Vec<ChatMessage>>,
    settings: Option<RecoverySettings>,
}

impl MemoryState {
    fn waiting_others(&self, exclude: SessionId) -> i64 {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Waiting && s.id != exclude)
            .count() as i64
    }

    fn close_gap(&mut self, position: i32, exclude: SessionId) {
        for s in self.sessions.values_mut() {
            if s.status == SessionStatus::Waiting && s.id != exclude && s.queue_position > position
            {
                s.queue_position -= 1;
            }
        }
    }

    fn open_gap(&mut self, position: i32, exclude: SessionId) {
        for s in self.sessions.values_mut() {
            if s.status == SessionStatus::Waiting && s.id != exclude && s.queue_position >= position
            {
                s.queue_position += 1;
            }
        }
    }

    /// Sessions occupying the staff member: active ones plus those held for
    /// them through a grace window
    fn active_chats(&self, username: &str) -> i64 {
        self.sessions
            .values()
            .filter(|s| s.status.holds_staff() && s.is_assigned_to(username))
            .count() as i64
    }

    fn staff_is_assignable(staff: &StaffAvailability) -> bool {
        staff.is_active && staff.is_online && staff.auto_assign_enabled && staff.mode.accepts_chats()
    }
}

pub struct InMemoryChatStore {
    state: RwLock<MemoryState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn insert_session(&self, new: NewSession) -> EngineResult<ChatSession> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();
        let position = QueuePlacement::End.resolve(false, 0, state.waiting_others(new.id));

        let session = ChatSession {
            id: new.id,
            recovery_token: new.recovery_token,
            guest_name: new.guest_name,
            guest_email: new.guest_email,
            department: new.department,
            status: SessionStatus::Waiting,
            assigned_to: None,
            previously_assigned_to: None,
            priority: new.priority,
            queue_position: position,
            original_queue_position: None,
            staff_disconnect_count: 0,
            recovery_attempts: 0,
            is_escalated: false,
            version: 0,
            created_at: now,
            assigned_at: None,
            requeued_at: None,
            disconnected_at: None,
            last_guest_activity_at: now,
            ended_at: None,
        };
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> EngineResult<Option<ChatSession>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn get_session_by_token(
        &self,
        recovery_token: &str,
    ) -> EngineResult<Option<ChatSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .find(|s| s.recovery_token == recovery_token)
            .cloned())
    }

    async fn get_waiting_sessions(&self, filter: &WaitingFilter) -> EngineResult<Vec<ChatSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<ChatSession> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Waiting)
            .filter(|s| match &filter.department {
                Some(dept) => s
                    .department
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case(dept)),
                None => true,
            })
            .filter(|s| !filter.escalated_only || s.is_escalated)
            .filter(|s| match filter.requeued_before {
                Some(cutoff) => s.requeued_at.is_some_and(|at| at < cutoff),
                None => true,
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.queue_position, s.created_at));
        Ok(sessions)
    }

    async fn get_staff_sessions(
        &self,
        username: &str,
        status: SessionStatus,
    ) -> EngineResult<Vec<ChatSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == status && s.is_assigned_to(username))
            .cloned()
            .collect())
    }

    async fn conditional_assign(
        &self,
        id: SessionId,
        username: &str,
    ) -> EngineResult<AssignWrite> {
        let mut state = self.state.write().await;

        let (status, position) = match state.sessions.get(&id) {
            Some(s) => (s.status, s.queue_position),
            None => return Err(EngineError::SessionNotFound(id)),
        };
        if status != SessionStatus::Waiting {
            return Ok(AssignWrite::SessionNotWaiting);
        }

        let Some(staff) = state.staff.get(username) else {
            return Ok(AssignWrite::StaffUnavailable);
        };
        if !MemoryState::staff_is_assignable(staff) {
            return Ok(AssignWrite::StaffUnavailable);
        }
        if state.active_chats(username) >= i64::from(staff.max_concurrent_chats) {
            return Ok(AssignWrite::StaffAtCapacity);
        }

        state.close_gap(position, id);
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        session.status = SessionStatus::Active;
        session.assigned_to = Some(username.to_string());
        session.assigned_at = Some(OffsetDateTime::now_utc());
        session.original_queue_position.get_or_insert(position);
        session.version += 1;

        Ok(AssignWrite::Assigned(session.clone()))
    }

    async fn update_session(
        &self,
        session: &ChatSession,
        expected_version: i64,
        placement: QueuePlacement,
    ) -> EngineResult<Option<ChatSession>> {
        let mut state = self.state.write().await;

        let current = state
            .sessions
            .get(&session.id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(session.id))?;
        if current.version != expected_version {
            return Ok(None);
        }

        let was_waiting = current.status == SessionStatus::Waiting;
        if was_waiting {
            state.close_gap(current.queue_position, session.id);
        }

        let mut updated = session.clone();
        updated.recovery_token = current.recovery_token.clone();
        updated.guest_name = current.guest_name.clone();
        updated.guest_email = current.guest_email.clone();
        updated.created_at = current.created_at;
        updated.last_guest_activity_at = current.last_guest_activity_at;
        updated.version = current.version + 1;

        if updated.status == SessionStatus::Waiting {
            let others = state.waiting_others(session.id);
            let position = placement.resolve(was_waiting, current.queue_position, others);
            state.open_gap(position, session.id);
            updated.queue_position = position;
        }

        state.sessions.insert(updated.id, updated.clone());
        Ok(Some(updated))
    }

    async fn touch_guest_activity(&self, id: SessionId) -> EngineResult<Option<OffsetDateTime>> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&id) {
            None => Ok(None),
            Some(s) if s.status == SessionStatus::Ended => Err(EngineError::SessionEnded(id)),
            Some(s) => {
                s.last_guest_activity_at = OffsetDateTime::now_utc();
                Ok(Some(s.last_guest_activity_at))
            }
        }
    }

    async fn find_recoverable_session(
        &self,
        guest_name: &str,
        guest_email: &str,
        since: OffsetDateTime,
    ) -> EngineResult<Option<ChatSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status.is_recoverable())
            .filter(|s| s.created_at >= since)
            .filter(|s| {
                s.guest_name.trim().eq_ignore_ascii_case(guest_name.trim())
                    && s.guest_email.trim().eq_ignore_ascii_case(guest_email.trim())
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_inactive_sessions(
        &self,
        idle_before: OffsetDateTime,
    ) -> EngineResult<Vec<ChatSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Waiting | SessionStatus::Active))
            .filter(|s| s.last_guest_activity_at < idle_before)
            .cloned()
            .collect())
    }

    async fn find_expired_grace_sessions(
        &self,
        disconnected_before: OffsetDateTime,
    ) -> EngineResult<Vec<ChatSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::StaffDisconnected)
            .filter(|s| s.disconnected_at.is_some_and(|at| at < disconnected_before))
            .cloned()
            .collect())
    }

    async fn list_escalated_sessions(&self) -> EngineResult<Vec<ChatSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<ChatSession> = state
            .sessions
            .values()
            .filter(|s| s.is_escalated)
            .filter(|s| {
                matches!(
                    s.status,
                    SessionStatus::Waiting | SessionStatus::Active | SessionStatus::StaffDisconnected
                )
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(sessions)
    }

    async fn upsert_staff_availability(
        &self,
        username: &str,
        update: &StaffAvailabilityUpdate,
    ) -> EngineResult<StaffAvailability> {
        if update.max_concurrent_chats.is_some_and(|max| max < 1) {
            return Err(EngineError::InvalidInput(
                "max_concurrent_chats must be at least 1".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();
        let staff = state
            .staff
            .entry(username.to_string())
            .or_insert_with(|| StaffAvailability {
                username: username.to_string(),
                display_name: username.to_string(),
                mode: WorkMode::Offline,
                max_concurrent_chats: 3,
                auto_assign_enabled: true,
                accepts_escalated: false,
                accepts_vip: false,
                preferred_departments: Vec::new(),
                is_active: true,
                is_online: false,
                last_activity_at: now,
            });

        if let Some(name) = &update.display_name {
            staff.display_name = name.clone();
        }
        if let Some(mode) = update.mode {
            staff.mode = mode;
        }
        if let Some(max) = update.max_concurrent_chats {
            staff.max_concurrent_chats = max;
        }
        if let Some(enabled) = update.auto_assign_enabled {
            staff.auto_assign_enabled = enabled;
        }
        if let Some(accepts) = update.accepts_escalated {
            staff.accepts_escalated = accepts;
        }
        if let Some(accepts) = update.accepts_vip {
            staff.accepts_vip = accepts;
        }
        if let Some(departments) = &update.preferred_departments {
            staff.preferred_departments = departments.clone();
        }
        if let Some(active) = update.is_active {
            staff.is_active = active;
        }
        if let Some(online) = update.is_online {
            staff.is_online = online;
        }

        Ok(staff.clone())
    }

    async fn get_staff(&self, username: &str) -> EngineResult<Option<StaffAvailability>> {
        Ok(self.state.read().await.staff.get(username).cloned())
    }

    async fn touch_staff_activity(&self, username: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;
        if let Some(staff) = state.staff.get_mut(username) {
            staff.last_activity_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn get_available_staff(&self) -> EngineResult<Vec<StaffCandidate>> {
        let state = self.state.read().await;
        Ok(state
            .staff
            .values()
            .filter(|s| MemoryState::staff_is_assignable(s))
            .map(|s| StaffCandidate {
                staff: s.clone(),
                active_chats: state.active_chats(&s.username),
            })
            .collect())
    }

    async fn append_message(
        &self,
        session_id: SessionId,
        sender: MessageSender,
        sender_name: Option<&str>,
        content: &str,
    ) -> EngineResult<ChatMessage> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session_id) {
            return Err(EngineError::SessionNotFound(session_id));
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            sender,
            sender_name: sender_name.map(str::to_string),
            content: content.to_string(),
            is_deleted: false,
            created_at: OffsetDateTime::now_utc(),
        };
        state
            .messages
            .entry(session_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, session_id: SessionId) -> EngineResult<Vec<ChatMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(&session_id)
            .map(|messages| messages.iter().filter(|m| !m.is_deleted).cloned().collect())
            .unwrap_or_default())
    }

    async fn load_recovery_settings(&self) -> EngineResult<Option<RecoverySettings>> {
        Ok(self.state.read().await.settings.clone())
    }

    async fn save_recovery_settings(&self, settings: &RecoverySettings) -> EngineResult<()> {
        self.state.write().await.settings = Some(settings.clone());
        Ok(())
    }
}
