//! Queue matcher
//!
//! Picks the best available staff member for a waiting session. The ranking
//! is a total order so two matcher passes over the same data always agree:
//!
//! 1. mode rank (`ready` before `working`)
//! 2. active chat count, ascending
//! 3. last activity, ascending (longest idle first)
//! 4. username, as a final deterministic tie-break
//!
//! A department filter that excludes everyone yields no candidate. Falling
//! back to department-agnostic matching is the caller's decision.

use deskchat_shared::ChatPriority;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::models::{ChatSession, StaffCandidate};
use crate::store::ChatStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    pub department: Option<String>,
    pub is_escalated: bool,
    pub priority: ChatPriority,
}

impl MatchCriteria {
    pub fn for_session(session: &ChatSession) -> Self {
        Self {
            department: session.department.clone(),
            is_escalated: session.is_escalated,
            priority: session.priority,
        }
    }

    /// Same criteria with the department filter dropped
    pub fn without_department(&self) -> Self {
        Self {
            department: None,
            ..self.clone()
        }
    }

    fn admits(&self, candidate: &StaffCandidate) -> bool {
        let staff = &candidate.staff;
        if !(staff.is_active
            && staff.is_online
            && staff.auto_assign_enabled
            && staff.mode.accepts_chats()
            && candidate.has_capacity())
        {
            return false;
        }
        if self.is_escalated && !staff.accepts_escalated {
            return false;
        }
        if self.priority == ChatPriority::Vip && !staff.accepts_vip {
            return false;
        }
        match &self.department {
            Some(department) => staff.handles_department(department),
            None => true,
        }
    }
}

/// Filter and order candidates for `criteria`
pub fn rank(candidates: Vec<StaffCandidate>, criteria: &MatchCriteria) -> Vec<StaffCandidate> {
    let mut eligible: Vec<StaffCandidate> = candidates
        .into_iter()
        .filter(|c| criteria.admits(c))
        .collect();

    eligible.sort_by(|a, b| {
        a.staff
            .mode
            .match_rank()
            .cmp(&b.staff.mode.match_rank())
            .then(a.active_chats.cmp(&b.active_chats))
            .then(a.staff.last_activity_at.cmp(&b.staff.last_activity_at))
            .then_with(|| a.staff.username.cmp(&b.staff.username))
    });
    eligible
}

#[derive(Clone)]
pub struct QueueMatcher {
    store: Arc<dyn ChatStore>,
}

impl QueueMatcher {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Every eligible staff member, best first
    pub async fn rank_candidates(&self, criteria: &MatchCriteria) -> EngineResult<Vec<StaffCandidate>> {
        let available = self.store.get_available_staff().await?;
        Ok(rank(available, criteria))
    }

    pub async fn find_best_staff(&self, criteria: &MatchCriteria) -> EngineResult<Option<StaffCandidate>> {
        Ok(self.rank_candidates(criteria).await?.into_iter().next())
    }
}
