//! Chat session, staff availability and message records

use deskchat_shared::{ChatPriority, MessageSender, SessionId, SessionStatus, WorkMode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A guest conversation; the central aggregate of the engine
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: SessionId,
    #[serde(skip_serializing)]
    pub recovery_token: String,
    pub guest_name: String,
    pub guest_email: String,
    pub department: Option<String>,
    pub status: SessionStatus,
    pub assigned_to: Option<String>,
    pub previously_assigned_to: Option<String>,
    pub priority: ChatPriority,
    /// Meaningful only while `status = waiting`
    pub queue_position: i32,
    /// Position held before the first assignment
    pub original_queue_position: Option<i32>,
    pub staff_disconnect_count: i32,
    pub recovery_attempts: i32,
    pub is_escalated: bool,
    /// Optimistic concurrency token, bumped by every write
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub assigned_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub requeued_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub disconnected_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_guest_activity_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl ChatSession {
    pub fn is_assigned_to(&self, username: &str) -> bool {
        self.assigned_to.as_deref() == Some(username)
    }
}

/// Input for a new guest session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: SessionId,
    pub recovery_token: String,
    pub guest_name: String,
    pub guest_email: String,
    pub department: Option<String>,
    pub priority: ChatPriority,
}

/// Staff availability and capacity, one row per staff member
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StaffAvailability {
    pub username: String,
    pub display_name: String,
    pub mode: WorkMode,
    pub max_concurrent_chats: i32,
    pub auto_assign_enabled: bool,
    pub accepts_escalated: bool,
    pub accepts_vip: bool,
    pub preferred_departments: Vec<String>,
    /// Account is active (not deactivated)
    pub is_active: bool,
    /// Has at least one live connection
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl StaffAvailability {
    /// Empty preference set means any department
    pub fn handles_department(&self, department: &str) -> bool {
        self.preferred_departments.is_empty()
            || self
                .preferred_departments
                .iter()
                .any(|d| d.eq_ignore_ascii_case(department))
    }
}

/// Staff row plus the derived count of their active chats
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StaffCandidate {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub staff: StaffAvailability,
    /// Includes sessions held for the staff member through a grace window
    pub active_chats: i64,
}

impl StaffCandidate {
    pub fn has_capacity(&self) -> bool {
        self.active_chats < i64::from(self.staff.max_concurrent_chats)
    }
}

/// Append-only chat message
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: SessionId,
    pub sender: MessageSender,
    pub sender_name: Option<String>,
    pub content: String,
    pub is_deleted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
