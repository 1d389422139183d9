//! PostgreSQL chat store
//!
//! Every write that can move a session into or out of the queue runs in a
//! transaction holding a transaction-scoped advisory lock, so queue position
//! shifts from concurrent writers never interleave.

use async_trait::async_trait;
use deskchat_shared::{MessageSender, SessionId, SessionStatus};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AssignWrite, ChatStore, QueuePlacement, StaffAvailabilityUpdate, WaitingFilter};
use crate::error::{EngineError, EngineResult};
use crate::models::{ChatMessage, ChatSession, NewSession, StaffAvailability, StaffCandidate};
use crate::settings::RecoverySettings;

/// Advisory lock key guarding queue position rewrites ("dchatq")
const QUEUE_LOCK_KEY: i64 = 0x6463_6861_7471;

/// Sort key for priority stored as VARCHAR
const PRIORITY_RANK_SQL: &str =
    "CASE priority WHEN 'vip' THEN 3 WHEN 'urgent' THEN 2 WHEN 'high' THEN 1 ELSE 0 END";

#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_queue(tx: &mut Transaction<'_, Postgres>) -> EngineResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(QUEUE_LOCK_KEY)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn count_waiting_others(
        tx: &mut Transaction<'_, Postgres>,
        exclude: SessionId,
    ) -> EngineResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_sessions WHERE status = 'waiting' AND id <> $1",
        )
        .bind(exclude)
        .fetch_one(&mut **tx)
        .await?;
        Ok(count)
    }

    async fn close_gap(
        tx: &mut Transaction<'_, Postgres>,
        position: i32,
        exclude: SessionId,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE chat_sessions
            SET queue_position = queue_position - 1
            WHERE status = 'waiting' AND id <> $1 AND queue_position > $2
            "#,
        )
        .bind(exclude)
        .bind(position)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn open_gap(
        tx: &mut Transaction<'_, Postgres>,
        position: i32,
        exclude: SessionId,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE chat_sessions
            SET queue_position = queue_position + 1
            WHERE status = 'waiting' AND id <> $1 AND queue_position >= $2
            "#,
        )
        .bind(exclude)
        .bind(position)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn ping(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_session(&self, new: NewSession) -> EngineResult<ChatSession> {
        let mut tx = self.pool.begin().await?;
        Self::lock_queue(&mut tx).await?;

        let others = Self::count_waiting_others(&mut tx, new.id).await?;
        let position = QueuePlacement::End.resolve(false, 0, others);

        let session: ChatSession = sqlx::query_as(
            r#"
            INSERT INTO chat_sessions
                (id, recovery_token, guest_name, guest_email, department, status, priority, queue_position)
            VALUES ($1, $2, $3, $4, $5, 'waiting', $6, $7)
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(&new.recovery_token)
        .bind(&new.guest_name)
        .bind(&new.guest_email)
        .bind(&new.department)
        .bind(new.priority)
        .bind(position)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> EngineResult<Option<ChatSession>> {
        let session = sqlx::query_as("SELECT * FROM chat_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn get_session_by_token(
        &self,
        recovery_token: &str,
    ) -> EngineResult<Option<ChatSession>> {
        let session = sqlx::query_as("SELECT * FROM chat_sessions WHERE recovery_token = $1")
            .bind(recovery_token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn get_waiting_sessions(&self, filter: &WaitingFilter) -> EngineResult<Vec<ChatSession>> {
        let sessions = sqlx::query_as(
            r#"
            SELECT * FROM chat_sessions
            WHERE status = 'waiting'
              AND ($1::VARCHAR IS NULL OR LOWER(department) = LOWER($1))
              AND (NOT $2 OR is_escalated)
              AND ($3::TIMESTAMPTZ IS NULL OR requeued_at < $3)
            ORDER BY queue_position, created_at
            "#,
        )
        .bind(&filter.department)
        .bind(filter.escalated_only)
        .bind(filter.requeued_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn get_staff_sessions(
        &self,
        username: &str,
        status: SessionStatus,
    ) -> EngineResult<Vec<ChatSession>> {
        let sessions = sqlx::query_as(
            "SELECT * FROM chat_sessions WHERE assigned_to = $1 AND status = $2 ORDER BY assigned_at",
        )
        .bind(username)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn conditional_assign(
        &self,
        id: SessionId,
        username: &str,
    ) -> EngineResult<AssignWrite> {
        let mut tx = self.pool.begin().await?;
        Self::lock_queue(&mut tx).await?;

        let current: Option<(SessionStatus, i32)> = sqlx::query_as(
            "SELECT status, queue_position FROM chat_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((status, position)) = current else {
            return Err(EngineError::SessionNotFound(id));
        };
        if status != SessionStatus::Waiting {
            return Ok(AssignWrite::SessionNotWaiting);
        }

        // Lock the staff row so concurrent assignments to the same agent
        // serialize on the capacity check
        let staff: Option<StaffAvailability> = sqlx::query_as(
            "SELECT * FROM chat_staff_availability WHERE username = $1 FOR UPDATE",
        )
        .bind(username)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(staff) = staff else {
            return Ok(AssignWrite::StaffUnavailable);
        };
        if !(staff.is_active && staff.is_online && staff.auto_assign_enabled && staff.mode.accepts_chats())
        {
            return Ok(AssignWrite::StaffUnavailable);
        }

        let active: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chat_sessions
            WHERE assigned_to = $1 AND status IN ('active', 'staff_disconnected')
            "#,
        )
        .bind(username)
        .fetch_one(&mut *tx)
        .await?;
        if active >= i64::from(staff.max_concurrent_chats) {
            return Ok(AssignWrite::StaffAtCapacity);
        }

        let session: Option<ChatSession> = sqlx::query_as(
            r#"
            UPDATE chat_sessions
            SET status = 'active',
                assigned_to = $2,
                assigned_at = NOW(),
                original_queue_position = COALESCE(original_queue_position, queue_position),
                version = version + 1
            WHERE id = $1 AND status = 'waiting'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(username)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(session) = session else {
            return Ok(AssignWrite::SessionNotWaiting);
        };

        Self::close_gap(&mut tx, position, id).await?;
        tx.commit().await?;

        Ok(AssignWrite::Assigned(session))
    }

    async fn update_session(
        &self,
        session: &ChatSession,
        expected_version: i64,
        placement: QueuePlacement,
    ) -> EngineResult<Option<ChatSession>> {
        let mut tx = self.pool.begin().await?;
        Self::lock_queue(&mut tx).await?;

        let current: Option<(SessionStatus, i32, i64)> = sqlx::query_as(
            "SELECT status, queue_position, version FROM chat_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(session.id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((status, previous_position, version)) = current else {
            return Err(EngineError::SessionNotFound(session.id));
        };
        if version != expected_version {
            return Ok(None);
        }

        let was_waiting = status == SessionStatus::Waiting;
        if was_waiting {
            Self::close_gap(&mut tx, previous_position, session.id).await?;
        }

        let mut position = session.queue_position;
        if session.status == SessionStatus::Waiting {
            let others = Self::count_waiting_others(&mut tx, session.id).await?;
            position = placement.resolve(was_waiting, previous_position, others);
            Self::open_gap(&mut tx, position, session.id).await?;
        }

        let updated: ChatSession = sqlx::query_as(
            r#"
            UPDATE chat_sessions
            SET department = $2,
                status = $3,
                assigned_to = $4,
                previously_assigned_to = $5,
                priority = $6,
                queue_position = $7,
                original_queue_position = $8,
                staff_disconnect_count = $9,
                recovery_attempts = $10,
                is_escalated = $11,
                assigned_at = $12,
                requeued_at = $13,
                disconnected_at = $14,
                ended_at = $15,
                version = version + 1
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(session.id)
        .bind(&session.department)
        .bind(session.status)
        .bind(&session.assigned_to)
        .bind(&session.previously_assigned_to)
        .bind(session.priority)
        .bind(position)
        .bind(session.original_queue_position)
        .bind(session.staff_disconnect_count)
        .bind(session.recovery_attempts)
        .bind(session.is_escalated)
        .bind(session.assigned_at)
        .bind(session.requeued_at)
        .bind(session.disconnected_at)
        .bind(session.ended_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn touch_guest_activity(&self, id: SessionId) -> EngineResult<Option<OffsetDateTime>> {
        let touched = sqlx::query_scalar(
            r#"
            UPDATE chat_sessions SET last_guest_activity_at = NOW()
            WHERE id = $1 AND status <> 'ended'
            RETURNING last_guest_activity_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if touched.is_some() {
            return Ok(touched);
        }

        let exists: Option<SessionStatus> =
            sqlx::query_scalar("SELECT status FROM chat_sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => Err(EngineError::SessionEnded(id)),
            None => Ok(None),
        }
    }

    async fn find_recoverable_session(
        &self,
        guest_name: &str,
        guest_email: &str,
        since: OffsetDateTime,
    ) -> EngineResult<Option<ChatSession>> {
        let session = sqlx::query_as(
            r#"
            SELECT * FROM chat_sessions
            WHERE LOWER(guest_email) = LOWER($2)
              AND LOWER(guest_name) = LOWER($1)
              AND status <> 'ended'
              AND created_at >= $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(guest_name.trim())
        .bind(guest_email.trim())
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn find_inactive_sessions(
        &self,
        idle_before: OffsetDateTime,
    ) -> EngineResult<Vec<ChatSession>> {
        let sessions = sqlx::query_as(
            r#"
            SELECT * FROM chat_sessions
            WHERE status IN ('waiting', 'active') AND last_guest_activity_at < $1
            "#,
        )
        .bind(idle_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn find_expired_grace_sessions(
        &self,
        disconnected_before: OffsetDateTime,
    ) -> EngineResult<Vec<ChatSession>> {
        let sessions = sqlx::query_as(
            r#"
            SELECT * FROM chat_sessions
            WHERE status = 'staff_disconnected' AND disconnected_at < $1
            "#,
        )
        .bind(disconnected_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn list_escalated_sessions(&self) -> EngineResult<Vec<ChatSession>> {
        let query = format!(
            r#"
            SELECT * FROM chat_sessions
            WHERE is_escalated AND status IN ('waiting', 'active', 'staff_disconnected')
            ORDER BY {PRIORITY_RANK_SQL} DESC, created_at
            "#
        );
        let sessions = sqlx::query_as(&query).fetch_all(&self.pool).await?;
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

        let staff = sqlx::query_as(
            r#"
            INSERT INTO chat_staff_availability
                (username, display_name, mode, max_concurrent_chats, auto_assign_enabled,
                 accepts_escalated, accepts_vip, preferred_departments, is_active, is_online)
            VALUES ($1, COALESCE($2, $1), COALESCE($3, 'offline'), COALESCE($4, 3),
                    COALESCE($5, TRUE), COALESCE($6, FALSE), COALESCE($7, FALSE),
                    COALESCE($8, '{}'::TEXT[]), COALESCE($9, TRUE), COALESCE($10, FALSE))
            ON CONFLICT (username) DO UPDATE SET
                display_name = COALESCE($2, chat_staff_availability.display_name),
                mode = COALESCE($3, chat_staff_availability.mode),
                max_concurrent_chats = COALESCE($4, chat_staff_availability.max_concurrent_chats),
                auto_assign_enabled = COALESCE($5, chat_staff_availability.auto_assign_enabled),
                accepts_escalated = COALESCE($6, chat_staff_availability.accepts_escalated),
                accepts_vip = COALESCE($7, chat_staff_availability.accepts_vip),
                preferred_departments = COALESCE($8, chat_staff_availability.preferred_departments),
                is_active = COALESCE($9, chat_staff_availability.is_active),
                is_online = COALESCE($10, chat_staff_availability.is_online),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(username)
        .bind(&update.display_name)
        .bind(update.mode)
        .bind(update.max_concurrent_chats)
        .bind(update.auto_assign_enabled)
        .bind(update.accepts_escalated)
        .bind(update.accepts_vip)
        .bind(&update.preferred_departments)
        .bind(update.is_active)
        .bind(update.is_online)
        .fetch_one(&self.pool)
        .await?;
        Ok(staff)
    }

    async fn get_staff(&self, username: &str) -> EngineResult<Option<StaffAvailability>> {
        let staff = sqlx::query_as("SELECT * FROM chat_staff_availability WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(staff)
    }

    async fn touch_staff_activity(&self, username: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE chat_staff_availability SET last_activity_at = NOW() WHERE username = $1",
        )
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_available_staff(&self) -> EngineResult<Vec<StaffCandidate>> {
        let candidates = sqlx::query_as(
            r#"
            SELECT s.*,
                   (SELECT COUNT(*) FROM chat_sessions c
                    WHERE c.assigned_to = s.username
                      AND c.status IN ('active', 'staff_disconnected')) AS active_chats
            FROM chat_staff_availability s
            WHERE s.is_active
              AND s.is_online
              AND s.auto_assign_enabled
              AND s.mode IN ('ready', 'working')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates)
    }

    async fn append_message(
        &self,
        session_id: SessionId,
        sender: MessageSender,
        sender_name: Option<&str>,
        content: &str,
    ) -> EngineResult<ChatMessage> {
        let message: Option<ChatMessage> = sqlx::query_as(
            r#"
            INSERT INTO chat_messages (id, session_id, sender, sender_name, content)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (SELECT 1 FROM chat_sessions WHERE id = $2)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(sender)
        .bind(sender_name)
        .bind(content)
        .fetch_optional(&self.pool)
        .await?;

        message.ok_or(EngineError::SessionNotFound(session_id))
    }

    async fn list_messages(&self, session_id: SessionId) -> EngineResult<Vec<ChatMessage>> {
        let messages = sqlx::query_as(
            r#"
            SELECT * FROM chat_messages
            WHERE session_id = $1 AND NOT is_deleted
            ORDER BY created_at, id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn load_recovery_settings(&self) -> EngineResult<Option<RecoverySettings>> {
        let document: Option<Json<serde_json::Value>> =
            sqlx::query_scalar("SELECT settings FROM chat_recovery_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        match document {
            Some(Json(value)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save_recovery_settings(&self, settings: &RecoverySettings) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_recovery_settings (id, settings)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET settings = EXCLUDED.settings, updated_at = NOW()
            "#,
        )
        .bind(Json(settings))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
