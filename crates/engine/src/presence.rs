//! Presence and work-mode registry
//!
//! Owns staff availability rows and live connection counts. Connection
//! counting is what turns transport events into supervisor signals: the first
//! connection of a staff member is a reconnect, closing the last is a
//! disconnect.

use deskchat_shared::WorkMode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::EngineContext;
use crate::coordinator::AssignmentCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::models::StaffAvailability;
use crate::store::StaffAvailabilityUpdate;
use crate::supervisor::RecoverySupervisor;

/// Staff-editable capacity and routing preferences
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaffPreferences {
    pub max_concurrent_chats: Option<i32>,
    pub auto_assign_enabled: Option<bool>,
    pub accepts_escalated: Option<bool>,
    pub accepts_vip: Option<bool>,
    pub preferred_departments: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct PresenceRegistry {
    ctx: EngineContext,
    coordinator: AssignmentCoordinator,
    supervisor: RecoverySupervisor,
    connections: Arc<Mutex<HashMap<String, usize>>>,
}

impl PresenceRegistry {
    pub fn new(
        ctx: EngineContext,
        coordinator: AssignmentCoordinator,
        supervisor: RecoverySupervisor,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            supervisor,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn require(&self, username: &str) -> EngineResult<StaffAvailability> {
        self.ctx
            .store
            .get_staff(username)
            .await?
            .ok_or_else(|| EngineError::StaffNotFound(username.to_string()))
    }

    /// Create or refresh a staff row. Re-registering reactivates the account.
    pub async fn register_staff(
        &self,
        username: &str,
        display_name: &str,
    ) -> EngineResult<StaffAvailability> {
        let username = username.trim();
        if username.is_empty() {
            return Err(EngineError::InvalidInput("username is required".to_string()));
        }
        let display_name = match display_name.trim() {
            "" => username,
            name => name,
        };

        self.ctx
            .store
            .upsert_staff_availability(
                username,
                &StaffAvailabilityUpdate {
                    display_name: Some(display_name.to_string()),
                    is_active: Some(true),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn set_mode(&self, username: &str, mode: WorkMode) -> EngineResult<StaffAvailability> {
        let previous = self.require(username).await?;
        let staff = self
            .ctx
            .store
            .upsert_staff_availability(
                username,
                &StaffAvailabilityUpdate {
                    mode: Some(mode),
                    ..Default::default()
                },
            )
            .await?;
        self.ctx.store.touch_staff_activity(username).await?;

        if previous.mode != mode {
            tracing::info!(staff = %username, from = %previous.mode, to = %mode, "Work mode changed");
        }
        if mode.accepts_chats() {
            self.coordinator.dispatch_waiting().await?;
        }
        Ok(staff)
    }

    pub async fn update_preferences(
        &self,
        username: &str,
        preferences: StaffPreferences,
    ) -> EngineResult<StaffAvailability> {
        if preferences.max_concurrent_chats.is_some_and(|max| max < 1) {
            return Err(EngineError::InvalidInput(
                "max_concurrent_chats must be at least 1".to_string(),
            ));
        }
        self.require(username).await?;

        let departments = preferences.preferred_departments.map(|departments| {
            departments
                .into_iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect()
        });

        let staff = self
            .ctx
            .store
            .upsert_staff_availability(
                username,
                &StaffAvailabilityUpdate {
                    max_concurrent_chats: preferences.max_concurrent_chats,
                    auto_assign_enabled: preferences.auto_assign_enabled,
                    accepts_escalated: preferences.accepts_escalated,
                    accepts_vip: preferences.accepts_vip,
                    preferred_departments: departments,
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            staff = %username,
            max_concurrent_chats = staff.max_concurrent_chats,
            auto_assign = staff.auto_assign_enabled,
            "Staff chat preferences updated"
        );
        if staff.mode.accepts_chats() {
            self.coordinator.dispatch_waiting().await?;
        }
        Ok(staff)
    }

    /// Account deactivated: never matched again, held sessions go through
    /// the normal disconnect path
    pub async fn deactivate(&self, username: &str) -> EngineResult<StaffAvailability> {
        self.require(username).await?;
        let staff = self
            .ctx
            .store
            .upsert_staff_availability(
                username,
                &StaffAvailabilityUpdate {
                    mode: Some(WorkMode::Offline),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.connections().remove(username);
        self.supervisor.staff_disconnected(username).await?;

        tracing::info!(staff = %username, "Staff deactivated for chat");
        Ok(staff)
    }

    pub async fn get(&self, username: &str) -> EngineResult<Option<StaffAvailability>> {
        self.ctx.store.get_staff(username).await
    }

    pub fn connection_count(&self, username: &str) -> usize {
        self.connections().get(username).copied().unwrap_or(0)
    }

    /// Register a live connection. Returns whether it is the staff member's
    /// first one.
    pub async fn connection_opened(&self, username: &str) -> EngineResult<bool> {
        let first = {
            let mut connections = self.connections();
            let count = connections.entry(username.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            if let Err(e) = self.supervisor.staff_reconnected(username).await {
                // Roll back so a retry is treated as the first connection again
                self.release(username);
                return Err(e);
            }
        }
        Ok(first)
    }

    /// Drop a live connection. Returns whether it was the last one.
    pub async fn connection_closed(&self, username: &str) -> EngineResult<bool> {
        let last = self.release(username);
        if last {
            self.supervisor.staff_disconnected(username).await?;
        }
        Ok(last)
    }

    fn release(&self, username: &str) -> bool {
        let mut connections = self.connections();
        match connections.get_mut(username) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                connections.remove(username);
                true
            }
            None => false,
        }
    }
}
