//! Guest chat routes
//!
//! Guests are anonymous. Creating a session hands back its recovery token,
//! which every later call must present; a wrong token looks exactly like a
//! missing session.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use deskchat_engine::{ChatMessage, ChatSession, EndedBy, GuestDetails, RecoveredSession};
use deskchat_shared::SessionId;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub token: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct EndSessionRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub guest_name: String,
    pub guest_email: String,
    /// Defaults to the configured recovery window
    #[serde(default)]
    pub search_window_hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub token: String,
}

/// A session together with the token the guest must keep
#[derive(Debug, Serialize)]
pub struct GuestSessionResponse {
    pub session: ChatSession,
    pub recovery_token: String,
}

impl From<ChatSession> for GuestSessionResponse {
    fn from(session: ChatSession) -> Self {
        let recovery_token = session.recovery_token.clone();
        Self {
            session,
            recovery_token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecoveredSessionResponse {
    pub session: ChatSession,
    pub recovery_token: String,
    pub message_history: Vec<ChatMessage>,
}

impl From<RecoveredSession> for RecoveredSessionResponse {
    fn from(recovered: RecoveredSession) -> Self {
        let recovery_token = recovered.session.recovery_token.clone();
        Self {
            session: recovered.session,
            recovery_token,
            message_history: recovered.message_history,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Start a new guest chat session
pub async fn start_session(
    State(state): State<AppState>,
    Json(details): Json<GuestDetails>,
) -> ApiResult<(StatusCode, Json<GuestSessionResponse>)> {
    let session = state.engine.sessions.start_session(details).await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// Current state of the guest's session
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<ChatSession>> {
    let session = state
        .engine
        .sessions
        .get_for_guest(session_id, &query.token)
        .await?;
    Ok(Json(session))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    state
        .engine
        .sessions
        .get_for_guest(session_id, &query.token)
        .await?;
    let messages = state.engine.sessions.message_history(session_id).await?;
    Ok(Json(messages))
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    state
        .engine
        .sessions
        .get_for_guest(session_id, &req.token)
        .await?;
    let message = state
        .engine
        .sessions
        .post_guest_message(session_id, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<EndSessionRequest>,
) -> ApiResult<Json<ChatSession>> {
    state
        .engine
        .sessions
        .get_for_guest(session_id, &req.token)
        .await?;
    let session = state
        .engine
        .sessions
        .end_session(session_id, EndedBy::Guest)
        .await?;
    Ok(Json(session))
}

/// Find and recover a returning guest's session by name and email
pub async fn recover_session(
    State(state): State<AppState>,
    Json(req): Json<RecoverRequest>,
) -> ApiResult<Json<RecoveredSessionResponse>> {
    let recovered = state
        .engine
        .recovery
        .reconnect(&req.guest_name, &req.guest_email, req.search_window_hours)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(recovered.into()))
}

/// Recover a session by its recovery token
pub async fn resume_session(
    State(state): State<AppState>,
    Json(req): Json<ResumeRequest>,
) -> ApiResult<Json<RecoveredSessionResponse>> {
    let recovered = state
        .engine
        .recovery
        .resume_by_token(&req.token)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(recovered.into()))
}
