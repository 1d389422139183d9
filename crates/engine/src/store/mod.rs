//! Session store access layer
//!
//! The engine talks to persistence only through [`ChatStore`]. Implementations
//! must provide three guarantees the engine relies on:
//!
//! - [`ChatStore::conditional_assign`] is atomic with respect to the session
//!   row and re-validates staff capacity inside the same critical section.
//! - [`ChatStore::update_session`] is a compare-and-swap on `version`.
//! - Waiting sessions keep contiguous queue positions `1..=n`: leaving the
//!   queue closes the gap and entering at position `p` shifts `>= p` down.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use deskchat_shared::{MessageSender, SessionId, SessionStatus, WorkMode};
use time::OffsetDateTime;

use crate::error::EngineResult;
use crate::models::{ChatMessage, ChatSession, NewSession, StaffAvailability, StaffCandidate};
use crate::settings::RecoverySettings;

pub use memory::InMemoryChatStore;
pub use postgres::PgChatStore;

/// Where a session lands when a write leaves it in `waiting`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePlacement {
    /// Keep the current position if already waiting, otherwise append
    Unchanged,
    Front,
    /// 1-based, clamped to the queue length + 1
    At(i32),
    End,
}

impl QueuePlacement {
    /// Resolve to a concrete position given the session's previous state and
    /// the number of *other* waiting sessions.
    pub fn resolve(self, was_waiting: bool, previous_position: i32, others_waiting: i64) -> i32 {
        let end = i32::try_from(others_waiting).unwrap_or(i32::MAX - 1) + 1;
        match self {
            Self::Unchanged if was_waiting => previous_position.clamp(1, end),
            Self::Unchanged | Self::End => end,
            Self::Front => 1,
            Self::At(position) => position.clamp(1, end),
        }
    }
}

/// Outcome of the atomic assignment primitive
#[derive(Debug, Clone)]
pub enum AssignWrite {
    Assigned(ChatSession),
    /// Zero rows matched `status = 'waiting'`: a race loss, not an error
    SessionNotWaiting,
    /// Capacity re-check inside the critical section failed
    StaffAtCapacity,
    /// Staff became ineligible (mode, auto-assign, offline, deactivated)
    StaffUnavailable,
}

/// Partial update for a staff availability row; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct StaffAvailabilityUpdate {
    pub display_name: Option<String>,
    pub mode: Option<WorkMode>,
    pub max_concurrent_chats: Option<i32>,
    pub auto_assign_enabled: Option<bool>,
    pub accepts_escalated: Option<bool>,
    pub accepts_vip: Option<bool>,
    pub preferred_departments: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub is_online: Option<bool>,
}

/// Filter for waiting-session reads
#[derive(Debug, Clone, Default)]
pub struct WaitingFilter {
    pub department: Option<String>,
    pub escalated_only: bool,
    /// Only sessions requeued before this instant
    pub requeued_before: Option<OffsetDateTime>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn ping(&self) -> EngineResult<()>;

    // --- Sessions ---

    /// Insert a `waiting` session at the end of the queue
    async fn insert_session(&self, session: NewSession) -> EngineResult<ChatSession>;

    async fn get_session(&self, id: SessionId) -> EngineResult<Option<ChatSession>>;

    async fn get_session_by_token(&self, recovery_token: &str)
        -> EngineResult<Option<ChatSession>>;

    /// Waiting sessions ordered by queue position
    async fn get_waiting_sessions(&self, filter: &WaitingFilter) -> EngineResult<Vec<ChatSession>>;

    async fn get_staff_sessions(
        &self,
        username: &str,
        status: SessionStatus,
    ) -> EngineResult<Vec<ChatSession>>;

    /// Atomically move a waiting session to `active` under `username`
    async fn conditional_assign(&self, id: SessionId, username: &str)
        -> EngineResult<AssignWrite>;

    /// Compare-and-swap write of every mutable column except
    /// `last_guest_activity_at`. Returns `None` on a version conflict.
    async fn update_session(
        &self,
        session: &ChatSession,
        expected_version: i64,
        placement: QueuePlacement,
    ) -> EngineResult<Option<ChatSession>>;

    /// Stamp guest activity. `None` if the session does not exist; an ended
    /// session is rejected.
    async fn touch_guest_activity(&self, id: SessionId) -> EngineResult<Option<OffsetDateTime>>;

    /// Most recent non-ended session for a guest, case-insensitive exact match
    async fn find_recoverable_session(
        &self,
        guest_name: &str,
        guest_email: &str,
        since: OffsetDateTime,
    ) -> EngineResult<Option<ChatSession>>;

    /// `waiting`/`active` sessions without guest activity since `idle_before`
    async fn find_inactive_sessions(
        &self,
        idle_before: OffsetDateTime,
    ) -> EngineResult<Vec<ChatSession>>;

    /// `staff_disconnected` sessions that entered grace before `disconnected_before`
    async fn find_expired_grace_sessions(
        &self,
        disconnected_before: OffsetDateTime,
    ) -> EngineResult<Vec<ChatSession>>;

    async fn list_escalated_sessions(&self) -> EngineResult<Vec<ChatSession>>;

    // --- Staff ---

    async fn upsert_staff_availability(
        &self,
        username: &str,
        update: &StaffAvailabilityUpdate,
    ) -> EngineResult<StaffAvailability>;

    async fn get_staff(&self, username: &str) -> EngineResult<Option<StaffAvailability>>;

    async fn touch_staff_activity(&self, username: &str) -> EngineResult<()>;

    /// Active, online staff in a chat-accepting mode with auto-assign on,
    /// each with a derived active chat count
    async fn get_available_staff(&self) -> EngineResult<Vec<StaffCandidate>>;

    // --- Messages ---

    async fn append_message(
        &self,
        session_id: SessionId,
        sender: MessageSender,
        sender_name: Option<&str>,
        content: &str,
    ) -> EngineResult<ChatMessage>;

    /// Chronological, soft-deleted messages excluded
    async fn list_messages(&self, session_id: SessionId) -> EngineResult<Vec<ChatMessage>>;

    // --- Settings ---

    async fn load_recovery_settings(&self) -> EngineResult<Option<RecoverySettings>>;

    async fn save_recovery_settings(&self, settings: &RecoverySettings) -> EngineResult<()>;
}
