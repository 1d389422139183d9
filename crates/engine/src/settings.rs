//! Recovery settings
//!
//! Process-wide, hot-reloadable configuration for disconnect recovery. The store
//! is the source of truth; [`RecoverySettingsCache`] keeps a validated copy in
//! memory and swaps it atomically on refresh or admin update.

use deskchat_shared::{ChatPriority, RequeuePolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::store::ChatStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub requeue_position: RequeuePolicy,
    pub priority_boost_amount: u8,
    pub staff_disconnect_timeout_seconds: u64,
    /// Window after a requeue during which the previous agent is preferred
    pub grace_period_seconds: u64,
    pub prefer_previous_staff: bool,
    pub auto_reassign_after_seconds: u64,
    pub max_disconnects_before_escalation: i32,
    pub escalation_priority: ChatPriority,
    pub guest_inactivity_timeout_minutes: u64,
    pub default_recovery_window_hours: u32,
    /// Retry without the department filter when it excludes everyone
    pub department_fallback: bool,
    pub staff_disconnect_message: String,
    pub reassignment_message: String,
    /// `{position}` is replaced with the guest's queue position
    pub queue_position_message: String,
    pub reconnecting_message: String,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            requeue_position: RequeuePolicy::PriorityBoost,
            priority_boost_amount: 1,
            staff_disconnect_timeout_seconds: 30,
            grace_period_seconds: 300,
            prefer_previous_staff: false,
            auto_reassign_after_seconds: 60,
            max_disconnects_before_escalation: 2,
            escalation_priority: ChatPriority::Urgent,
            guest_inactivity_timeout_minutes: 30,
            default_recovery_window_hours: 24,
            department_fallback: false,
            staff_disconnect_message:
                "Your agent was disconnected. We're connecting you with the next available agent."
                    .to_string(),
            reassignment_message: "You've been connected with a new agent.".to_string(),
            queue_position_message: "You are number {position} in the queue.".to_string(),
            reconnecting_message: "We're working on reconnecting you.".to_string(),
        }
    }
}

impl RecoverySettings {
    pub fn validate(&self) -> EngineResult<()> {
        fn invalid(msg: &str) -> EngineResult<()> {
            Err(EngineError::InvalidSettings(msg.to_string()))
        }

        if !(1..=3).contains(&self.priority_boost_amount) {
            return invalid("priority_boost_amount must be between 1 and 3");
        }
        if !(1..=3600).contains(&self.staff_disconnect_timeout_seconds) {
            return invalid("staff_disconnect_timeout_seconds must be between 1 and 3600");
        }
        if self.grace_period_seconds > 86_400 {
            return invalid("grace_period_seconds must be at most 86400");
        }
        if !(1..=3600).contains(&self.auto_reassign_after_seconds) {
            return invalid("auto_reassign_after_seconds must be between 1 and 3600");
        }
        if self.max_disconnects_before_escalation < 1 {
            return invalid("max_disconnects_before_escalation must be at least 1");
        }
        if !matches!(
            self.escalation_priority,
            ChatPriority::Urgent | ChatPriority::Vip
        ) {
            return invalid("escalation_priority must be urgent or vip");
        }
        if !(1..=1440).contains(&self.guest_inactivity_timeout_minutes) {
            return invalid("guest_inactivity_timeout_minutes must be between 1 and 1440");
        }
        if !(1..=168).contains(&self.default_recovery_window_hours) {
            return invalid("default_recovery_window_hours must be between 1 and 168");
        }
        for (name, text) in [
            ("staff_disconnect_message", &self.staff_disconnect_message),
            ("reassignment_message", &self.reassignment_message),
            ("queue_position_message", &self.queue_position_message),
            ("reconnecting_message", &self.reconnecting_message),
        ] {
            if text.trim().is_empty() {
                return Err(EngineError::InvalidSettings(format!(
                    "{name} must not be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn staff_disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.staff_disconnect_timeout_seconds)
    }

    pub fn auto_reassign_after(&self) -> Duration {
        Duration::from_secs(self.auto_reassign_after_seconds)
    }

    pub fn guest_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_inactivity_timeout_minutes * 60)
    }

    pub fn queue_position_text(&self, position: i32) -> String {
        self.queue_position_message
            .replace("{position}", &position.to_string())
    }
}

/// In-memory cache of the stored settings document
pub struct RecoverySettingsCache {
    store: Arc<dyn ChatStore>,
    current: RwLock<Arc<RecoverySettings>>,
}

impl RecoverySettingsCache {
    /// Load settings at startup. A missing document means defaults; an invalid
    /// one is a startup error.
    pub async fn load(store: Arc<dyn ChatStore>) -> EngineResult<Self> {
        let settings = match store.load_recovery_settings().await? {
            Some(settings) => settings,
            None => {
                tracing::info!("No stored recovery settings, using defaults");
                RecoverySettings::default()
            }
        };
        settings.validate()?;

        Ok(Self {
            store,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    /// Cache seeded with explicit settings, bypassing the store read
    pub fn with_settings(store: Arc<dyn ChatStore>, settings: RecoverySettings) -> EngineResult<Self> {
        settings.validate()?;
        Ok(Self {
            store,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    pub async fn current(&self) -> Arc<RecoverySettings> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-read from the store. An invalid document keeps the previous value.
    pub async fn refresh(&self) -> EngineResult<Arc<RecoverySettings>> {
        let Some(settings) = self.store.load_recovery_settings().await? else {
            return Ok(self.current().await);
        };

        if let Err(e) = settings.validate() {
            tracing::error!(error = %e, "Stored recovery settings are invalid, keeping previous");
            return Err(e);
        }

        let settings = Arc::new(settings);
        let mut current = self.current.write().await;
        if **current != *settings {
            tracing::info!("Recovery settings reloaded");
        }
        *current = Arc::clone(&settings);
        Ok(settings)
    }

    /// Validate, persist, then swap the cached copy
    pub async fn update(&self, settings: RecoverySettings) -> EngineResult<Arc<RecoverySettings>> {
        settings.validate()?;
        self.store.save_recovery_settings(&settings).await?;

        let settings = Arc::new(settings);
        *self.current.write().await = Arc::clone(&settings);
        tracing::info!(
            requeue_position = settings.requeue_position.as_str(),
            escalation_threshold = settings.max_disconnects_before_escalation,
            "Recovery settings updated"
        );
        Ok(settings)
    }
}
