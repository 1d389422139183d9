//! Guest session lifecycle
//!
//! Start, converse, end. Also the administrative reset and the supervisor
//! view over escalated sessions.

use deskchat_shared::{ChatPriority, MessageSender, SessionId, SessionStatus};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::context::{EngineContext, Transition};
use crate::coordinator::AssignmentCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::events::ChatEvent;
use crate::models::{ChatMessage, ChatSession, NewSession};
use crate::store::QueuePlacement;
use crate::supervisor::RecoverySupervisor;

const MAX_NAME_LEN: usize = 100;
const MAX_EMAIL_LEN: usize = 255;
const MAX_MESSAGE_LEN: usize = 5000;
const RECOVERY_TOKEN_BYTES: usize = 32;

/// Guest-supplied details for a new session
#[derive(Debug, Clone, Deserialize)]
pub struct GuestDetails {
    pub guest_name: String,
    pub guest_email: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub priority: ChatPriority,
}

impl GuestDetails {
    fn validate(&self) -> EngineResult<()> {
        let name = self.guest_name.trim();
        let email = self.guest_email.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::InvalidInput(format!(
                "guest name must be 1 to {MAX_NAME_LEN} characters"
            )));
        }
        if email.len() > MAX_EMAIL_LEN || !email.contains('@') {
            return Err(EngineError::InvalidInput(
                "a valid guest email is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Who closed a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndedBy {
    Guest,
    /// Must be the current assignee
    Staff(String),
    Admin,
}

fn generate_recovery_token() -> String {
    let bytes: [u8; RECOVERY_TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

fn validate_content(content: &str) -> EngineResult<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(EngineError::InvalidInput("message must not be empty".to_string()));
    }
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(EngineError::InvalidInput(format!(
            "message must be at most {MAX_MESSAGE_LEN} characters"
        )));
    }
    Ok(content)
}

#[derive(Clone)]
pub struct SessionService {
    ctx: EngineContext,
    coordinator: AssignmentCoordinator,
    supervisor: RecoverySupervisor,
}

impl SessionService {
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

    /// Queue a new guest session and try to assign it right away. The returned
    /// session carries the recovery token the guest must keep.
    pub async fn start_session(&self, details: GuestDetails) -> EngineResult<ChatSession> {
        details.validate()?;
        let department = details
            .department
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let session = self
            .ctx
            .store
            .insert_session(NewSession {
                id: SessionId::new(),
                recovery_token: generate_recovery_token(),
                guest_name: details.guest_name.trim().to_string(),
                guest_email: details.guest_email.trim().to_string(),
                department,
                priority: details.priority,
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            priority = %session.priority,
            department = ?session.department,
            queue_position = session.queue_position,
            "Guest chat session started"
        );

        let settings = self.ctx.settings.current().await;
        self.supervisor.watch_guest(&session, &settings);

        if !self.coordinator.assign(session.id).await?.is_assigned() {
            let current = self.ctx.load_session(session.id).await?;
            if current.status == SessionStatus::Waiting {
                self.ctx.events.emit(ChatEvent::QueuePositionUpdated {
                    session_id: current.id,
                    queue_position: current.queue_position,
                    guest_message: settings.queue_position_text(current.queue_position),
                });
            }
        }

        self.ctx.load_session(session.id).await
    }

    /// End a session. Ending twice is rejected.
    pub async fn end_session(&self, id: SessionId, ended_by: EndedBy) -> EngineResult<ChatSession> {
        let now = OffsetDateTime::now_utc();
        let mut previous_status = SessionStatus::Ended;

        let transition = self
            .ctx
            .transition(id, |s| {
                if s.status == SessionStatus::Ended {
                    return Err(EngineError::SessionEnded(s.id));
                }
                if let EndedBy::Staff(username) = &ended_by {
                    if !s.is_assigned_to(username) {
                        return Err(EngineError::InvalidState(format!(
                            "session {} is not assigned to {username}",
                            s.id
                        )));
                    }
                }
                previous_status = s.status;
                s.status = SessionStatus::Ended;
                s.ended_at = Some(now);
                Ok(Some(QueuePlacement::Unchanged))
            })
            .await?;

        let session = match transition {
            Transition::Applied(session) | Transition::Skipped(session) => session,
        };

        self.ctx.timers.cancel_all(id);
        tracing::info!(session_id = %id, ended_by = ?ended_by, "Chat session ended");
        self.ctx.events.emit(ChatEvent::SessionEnded { session_id: id });

        match previous_status {
            SessionStatus::Active => {
                self.coordinator.dispatch_waiting().await?;
            }
            SessionStatus::Waiting => self.coordinator.announce_queue_positions().await?,
            _ => {}
        }
        Ok(session)
    }

    pub async fn post_guest_message(&self, id: SessionId, content: &str) -> EngineResult<ChatMessage> {
        let content = validate_content(content)?;
        let session = self.ctx.load_session(id).await?;
        match session.status {
            SessionStatus::Ended => return Err(EngineError::SessionEnded(id)),
            SessionStatus::Abandoned => {
                return Err(EngineError::InvalidState(format!(
                    "session {id} is abandoned and must be recovered first"
                )))
            }
            _ => {}
        }

        let message = self
            .ctx
            .store
            .append_message(id, MessageSender::Guest, Some(&session.guest_name), content)
            .await?;
        self.supervisor.record_guest_activity(id).await?;

        self.ctx.events.emit(ChatEvent::MessagePosted {
            session_id: id,
            message: message.clone(),
        });
        Ok(message)
    }

    /// Only the current assignee of an active session may post
    pub async fn post_staff_message(
        &self,
        id: SessionId,
        username: &str,
        content: &str,
    ) -> EngineResult<ChatMessage> {
        let content = validate_content(content)?;
        let session = self.ctx.load_session(id).await?;
        if session.status == SessionStatus::Ended {
            return Err(EngineError::SessionEnded(id));
        }
        if session.status != SessionStatus::Active || !session.is_assigned_to(username) {
            return Err(EngineError::InvalidState(format!(
                "session {id} is not an active chat of {username}"
            )));
        }

        let staff = self
            .ctx
            .store
            .get_staff(username)
            .await?
            .ok_or_else(|| EngineError::StaffNotFound(username.to_string()))?;

        let message = self
            .ctx
            .store
            .append_message(id, MessageSender::Staff, Some(&staff.display_name), content)
            .await?;
        self.ctx.store.touch_staff_activity(username).await?;

        self.ctx.events.emit(ChatEvent::MessagePosted {
            session_id: id,
            message: message.clone(),
        });
        Ok(message)
    }

    pub async fn message_history(&self, id: SessionId) -> EngineResult<Vec<ChatMessage>> {
        self.ctx.load_session(id).await?;
        self.ctx.store.list_messages(id).await
    }

    /// Administrative reset of disconnect count, escalation and priority
    pub async fn admin_reset(&self, id: SessionId) -> EngineResult<ChatSession> {
        let transition = self
            .ctx
            .transition(id, |s| {
                if s.status == SessionStatus::Ended {
                    return Err(EngineError::SessionEnded(s.id));
                }
                s.staff_disconnect_count = 0;
                s.is_escalated = false;
                s.priority = ChatPriority::Normal;
                Ok(Some(QueuePlacement::Unchanged))
            })
            .await?;

        let session = match transition {
            Transition::Applied(session) | Transition::Skipped(session) => session,
        };
        tracing::info!(session_id = %id, "Session disconnect history reset by admin");
        Ok(session)
    }

    pub async fn list_escalated(&self) -> EngineResult<Vec<ChatSession>> {
        self.ctx.store.list_escalated_sessions().await
    }

    pub async fn get(&self, id: SessionId) -> EngineResult<ChatSession> {
        self.ctx.load_session(id).await
    }

    /// Session addressed by a guest. A token mismatch reads as not found.
    pub async fn get_for_guest(&self, id: SessionId, recovery_token: &str) -> EngineResult<ChatSession> {
        let session = self.ctx.load_session(id).await?;
        if session.recovery_token != recovery_token {
            return Err(EngineError::SessionNotFound(id));
        }
        Ok(session)
    }
}
