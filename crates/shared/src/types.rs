//! Common types used across deskchat

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DeskError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Guest chat session ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Staff work mode, self-reported or inferred from presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    Ready,
    Working,
    TicketOnly,
    Away,
    Offline,
}

impl Default for WorkMode {
    fn default() -> Self {
        Self::Offline
    }
}

impl WorkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Working => "working",
            Self::TicketOnly => "ticket_only",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }

    /// Whether staff in this mode may be picked by the queue matcher
    pub fn accepts_chats(&self) -> bool {
        matches!(self, Self::Ready | Self::Working)
    }

    /// Sort rank for matching; lower is preferred
    pub fn match_rank(&self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Working => 1,
            Self::TicketOnly => 2,
            Self::Away => 3,
            Self::Offline => 4,
        }
    }
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkMode {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "working" => Ok(Self::Working),
            "ticket_only" => Ok(Self::TicketOnly),
            "away" => Ok(Self::Away),
            "offline" => Ok(Self::Offline),
            other => Err(DeskError::Validation(format!("unknown work mode: {other}"))),
        }
    }
}

/// Guest chat session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    StaffDisconnected,
    Abandoned,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::StaffDisconnected => "staff_disconnected",
            Self::Abandoned => "abandoned",
            Self::Ended => "ended",
        }
    }

    /// Statuses a returning guest may recover from
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Ended)
    }

    /// Whether the session occupies its assigned staff member's capacity
    pub fn holds_staff(&self) -> bool {
        matches!(self, Self::Active | Self::StaffDisconnected)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session priority. Ordering follows escalation: normal < high < urgent < vip
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatPriority {
    Normal,
    High,
    Urgent,
    Vip,
}

impl Default for ChatPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl ChatPriority {
    const LADDER: [ChatPriority; 4] = [Self::Normal, Self::High, Self::Urgent, Self::Vip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Vip => "vip",
        }
    }

    fn level(&self) -> usize {
        match self {
            Self::Normal => 0,
            Self::High => 1,
            Self::Urgent => 2,
            Self::Vip => 3,
        }
    }

    /// Raise by `levels` steps, capped at vip
    pub fn boosted(self, levels: u8) -> Self {
        let target = (self.level() + levels as usize).min(Self::LADDER.len() - 1);
        Self::LADDER[target]
    }
}

impl fmt::Display for ChatPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatPriority {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            "vip" => Ok(Self::Vip),
            other => Err(DeskError::Validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Where a disrupted session re-enters the waiting queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeuePolicy {
    Front,
    PriorityBoost,
    Original,
    End,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::PriorityBoost
    }
}

impl RequeuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::PriorityBoost => "priority_boost",
            Self::Original => "original",
            Self::End => "end",
        }
    }
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    Guest,
    Staff,
    System,
}
