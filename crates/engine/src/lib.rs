//! deskchat guest chat engine
//!
//! Queues anonymous guest chat sessions, matches them to available staff,
//! survives staff disconnects with grace-period recovery and requeueing, and
//! lets returning guests recover interrupted sessions.
//!
//! The engine is storage-agnostic ([`store::ChatStore`]) and transport-agnostic:
//! it emits [`events::ChatEvent`]s on a channel and takes transport signals
//! (staff connections opened and closed) as method calls.

pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod matcher;
pub mod models;
pub mod presence;
pub mod recovery;
pub mod sessions;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod timers;

pub use coordinator::{AssignOutcome, AssignmentCoordinator, DispatchSummary, NotAssignedReason};
pub use error::{EngineError, EngineResult};
pub use events::{ChatEvent, EventEmitter, EventReceiver};
pub use matcher::{MatchCriteria, QueueMatcher};
pub use models::{ChatMessage, ChatSession, StaffAvailability, StaffCandidate};
pub use presence::{PresenceRegistry, StaffPreferences};
pub use recovery::{RecoveredSession, SessionRecovery};
pub use sessions::{EndedBy, GuestDetails, SessionService};
pub use settings::{RecoverySettings, RecoverySettingsCache};
pub use store::{ChatStore, InMemoryChatStore, PgChatStore};
pub use supervisor::RecoverySupervisor;

use context::EngineContext;
use std::sync::Arc;
use timers::SessionTimers;

/// The assembled engine. Cheap to clone; every component shares one store,
/// settings cache, event channel and timer registry.
#[derive(Clone)]
pub struct ChatEngine {
    ctx: EngineContext,
    pub matcher: QueueMatcher,
    pub coordinator: AssignmentCoordinator,
    pub supervisor: RecoverySupervisor,
    pub presence: PresenceRegistry,
    pub recovery: SessionRecovery,
    pub sessions: SessionService,
}

impl ChatEngine {
    /// Build an engine, loading recovery settings from the store
    pub async fn start(store: Arc<dyn ChatStore>) -> EngineResult<(Self, EventReceiver)> {
        let settings = RecoverySettingsCache::load(Arc::clone(&store)).await?;
        Ok(Self::assemble(store, settings))
    }

    /// Build an engine with explicit settings, ignoring the stored document
    pub fn with_settings(
        store: Arc<dyn ChatStore>,
        settings: RecoverySettings,
    ) -> EngineResult<(Self, EventReceiver)> {
        let settings = RecoverySettingsCache::with_settings(Arc::clone(&store), settings)?;
        Ok(Self::assemble(store, settings))
    }

    fn assemble(store: Arc<dyn ChatStore>, settings: RecoverySettingsCache) -> (Self, EventReceiver) {
        let (events, rx) = EventEmitter::channel();
        let ctx = EngineContext {
            store: Arc::clone(&store),
            settings: Arc::new(settings),
            events,
            timers: SessionTimers::new(),
        };

        let matcher = QueueMatcher::new(store);
        let coordinator = AssignmentCoordinator::new(ctx.clone(), matcher.clone());
        let supervisor = RecoverySupervisor::new(ctx.clone(), coordinator.clone());
        let presence = PresenceRegistry::new(ctx.clone(), coordinator.clone(), supervisor.clone());
        let recovery = SessionRecovery::new(ctx.clone(), coordinator.clone(), supervisor.clone());
        let sessions = SessionService::new(ctx.clone(), coordinator.clone(), supervisor.clone());

        let engine = Self {
            ctx,
            matcher,
            coordinator,
            supervisor,
            presence,
            recovery,
            sessions,
        };
        (engine, rx)
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.ctx.store
    }

    pub fn settings(&self) -> &Arc<RecoverySettingsCache> {
        &self.ctx.settings
    }

    pub fn timers(&self) -> &SessionTimers {
        &self.ctx.timers
    }

    /// Cancel every pending timer
    pub fn shutdown(&self) {
        self.ctx.timers.shutdown();
        tracing::info!("Chat engine timers stopped");
    }
}
