//! Per-session cancellable timers
//!
//! At most one timer of each [`TimerKind`] exists per session. Scheduling a
//! timer that already exists replaces it. Every timer is a child of a single
//! shutdown token so the whole registry can be cancelled on stop.
//!
//! Cancellation is best effort: a timer whose sleep already elapsed may still
//! run its callback. Callbacks therefore re-check session state before acting.

use deskchat_shared::SessionId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Staff disconnect grace window
    GracePeriod,
    /// Forced matcher pass for a requeued session
    AutoReassign,
    GuestInactivity,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GracePeriod => "grace_period",
            Self::AutoReassign => "auto_reassign",
            Self::GuestInactivity => "guest_inactivity",
        }
    }
}

struct TimerEntry {
    token: CancellationToken,
    generation: u64,
}

type TimerMap = HashMap<(SessionId, TimerKind), TimerEntry>;

#[derive(Clone)]
pub struct SessionTimers {
    entries: Arc<Mutex<TimerMap>>,
    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl SessionTimers {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerMap> {
        // The map holds no invariants a panicking holder could break
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule `callback` after `delay`, replacing any existing timer of the
    /// same kind for the session
    pub fn schedule<F, Fut>(&self, id: SessionId, kind: TimerKind, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.lock();
        if let Some(previous) = entries.remove(&(id, kind)) {
            previous.token.cancel();
        }
        self.spawn_locked(&mut entries, id, kind, delay, callback);
    }

    /// Schedule only if no timer of this kind is pending. Returns whether a
    /// new timer was started.
    pub fn schedule_if_absent<F, Fut>(
        &self,
        id: SessionId,
        kind: TimerKind,
        delay: Duration,
        callback: F,
    ) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.lock();
        if entries.contains_key(&(id, kind)) {
            return false;
        }
        self.spawn_locked(&mut entries, id, kind, delay, callback);
        true
    }

    fn spawn_locked<F, Fut>(
        &self,
        entries: &mut TimerMap,
        id: SessionId,
        kind: TimerKind,
        delay: Duration,
        callback: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            (id, kind),
            TimerEntry {
                token: token.clone(),
                generation,
            },
        );

        let timers = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(session_id = %id, timer = kind.as_str(), "Timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // Clear our own entry first so the callback may re-arm
                    timers.remove_generation(id, kind, generation);
                    tracing::debug!(session_id = %id, timer = kind.as_str(), "Timer fired");
                    callback().await;
                }
            }
        });
    }

    fn remove_generation(&self, id: SessionId, kind: TimerKind, generation: u64) {
        let mut entries = self.lock();
        if entries
            .get(&(id, kind))
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(&(id, kind));
        }
    }

    /// Cancel a pending timer. Returns whether one was pending.
    pub fn cancel(&self, id: SessionId, kind: TimerKind) -> bool {
        match self.lock().remove(&(id, kind)) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self, id: SessionId) {
        let mut entries = self.lock();
        entries.retain(|(session_id, _), entry| {
            if *session_id == id {
                entry.token.cancel();
                false
            } else {
                true
            }
        });
    }

    pub fn is_scheduled(&self, id: SessionId, kind: TimerKind) -> bool {
        self.lock().contains_key(&(id, kind))
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Cancel every timer, including ones scheduled after this call
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock().clear();
    }
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self::new()
    }
}
