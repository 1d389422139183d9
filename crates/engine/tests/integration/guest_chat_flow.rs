//! Integration tests for the guest chat lifecycle
//!
//! Drives the public engine API against the in-memory store. Timer-driven
//! paths run on a paused tokio clock, so grace periods and inactivity
//! timeouts elapse instantly and deterministically.
//!
//! ## Test Coverage
//! - Immediate assignment and matcher ordering
//! - Staff disconnect: resume within grace, requeue after grace, escalation
//! - Duplicate disconnect signals, concurrent assignment, capacity
//! - Auto-reassign, guest inactivity, recovery lookup
//! - Stale grace expiry, capacity held through grace, activity after end
//!
//! ## Running Tests
//! ```bash
//! cargo test -p deskchat-engine --test guest_chat_flow
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use deskchat_engine::store::StaffAvailabilityUpdate;
use deskchat_engine::timers::TimerKind;
use deskchat_engine::{
    AssignOutcome, ChatEngine, ChatEvent, ChatStore, EndedBy, EngineError, EventReceiver,
    GuestDetails, InMemoryChatStore, NotAssignedReason, RecoverySettings, StaffPreferences,
};
use deskchat_shared::{ChatPriority, RequeuePolicy, SessionId, SessionStatus, WorkMode};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Utilities
// ============================================================================

fn engine_with(settings: RecoverySettings) -> (ChatEngine, EventReceiver) {
    let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
    ChatEngine::with_settings(store, settings).expect("valid settings")
}

fn engine() -> (ChatEngine, EventReceiver) {
    engine_with(RecoverySettings::default())
}

/// Register, connect and mark a staff member ready through the presence API
async fn online_staff(engine: &ChatEngine, username: &str, max_chats: i32) {
    engine
        .presence
        .register_staff(username, &username.to_uppercase())
        .await
        .unwrap();
    engine
        .presence
        .update_preferences(
            username,
            StaffPreferences {
                max_concurrent_chats: Some(max_chats),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine.presence.connection_opened(username).await.unwrap();
    engine
        .presence
        .set_mode(username, WorkMode::Ready)
        .await
        .unwrap();
}

/// Make a staff member available directly in the store, without the
/// dispatch pass a presence change would trigger
async fn quietly_available(engine: &ChatEngine, username: &str, max_chats: i32) {
    engine
        .store()
        .upsert_staff_availability(
            username,
            &StaffAvailabilityUpdate {
                display_name: Some(username.to_uppercase()),
                mode: Some(WorkMode::Ready),
                max_concurrent_chats: Some(max_chats),
                is_online: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

fn guest(name: &str) -> GuestDetails {
    GuestDetails {
        guest_name: name.to_string(),
        guest_email: format!("{}@example.com", name.to_lowercase()),
        department: None,
        priority: ChatPriority::Normal,
    }
}

async fn status_of(engine: &ChatEngine, id: SessionId) -> SessionStatus {
    engine.sessions.get(id).await.unwrap().status
}

async fn active_count(engine: &ChatEngine, username: &str) -> usize {
    engine
        .store()
        .get_staff_sessions(username, SessionStatus::Active)
        .await
        .unwrap()
        .len()
}

fn drain(rx: &mut EventReceiver) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Advance the paused clock and let spawned timer tasks run
async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Assignment
// ============================================================================

#[tokio::test]
async fn test_new_session_assigned_to_ready_staff() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 3).await;

    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.assigned_to.as_deref(), Some("alice"));
    assert_eq!(session.staff_disconnect_count, 0);
    assert_eq!(active_count(&engine, "alice").await, 1);

    let assigned = drain(&mut rx).into_iter().find_map(|e| match e {
        ChatEvent::SessionAssigned {
            session_id,
            staff_username,
            staff_display_name,
            staff_mode,
            guest_message,
        } => Some((session_id, staff_username, staff_display_name, staff_mode, guest_message)),
        _ => None,
    });
    let (id, username, display, mode, message) = assigned.expect("session_assigned event");
    assert_eq!(id, session.id);
    assert_eq!(username, "alice");
    assert_eq!(display, "ALICE");
    assert_eq!(mode, WorkMode::Ready);
    assert!(message.is_none());
}

#[tokio::test]
async fn test_session_waits_without_staff_and_reports_position() {
    let (engine, mut rx) = engine();

    let first = engine.sessions.start_session(guest("One")).await.unwrap();
    let second = engine.sessions.start_session(guest("Two")).await.unwrap();

    assert_eq!(first.status, SessionStatus::Waiting);
    assert_eq!(first.queue_position, 1);
    assert_eq!(second.queue_position, 2);

    let positions: Vec<(SessionId, i32, String)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ChatEvent::QueuePositionUpdated {
                session_id,
                queue_position,
                guest_message,
            } => Some((session_id, queue_position, guest_message)),
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 2);
    assert_eq!(positions[1].0, second.id);
    assert_eq!(positions[1].2, "You are number 2 in the queue.");
}

#[tokio::test]
async fn test_staff_coming_online_picks_up_queue() {
    let (engine, _rx) = engine();
    let s1 = engine.sessions.start_session(guest("One")).await.unwrap();
    let s2 = engine.sessions.start_session(guest("Two")).await.unwrap();

    online_staff(&engine, "alice", 1).await;

    assert_eq!(status_of(&engine, s1.id).await, SessionStatus::Active);
    let s2 = engine.sessions.get(s2.id).await.unwrap();
    assert_eq!(s2.status, SessionStatus::Waiting);
    assert_eq!(s2.queue_position, 1);
}

#[tokio::test]
async fn test_fewer_active_chats_wins_over_idle_time() {
    let (engine, _rx) = engine();
    online_staff(&engine, "bob", 3).await;
    let first = engine.sessions.start_session(guest("One")).await.unwrap();
    assert_eq!(first.assigned_to.as_deref(), Some("bob"));

    // alice has the most recent activity but no chats
    online_staff(&engine, "alice", 3).await;
    let second = engine.sessions.start_session(guest("Two")).await.unwrap();
    assert_eq!(second.assigned_to.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_away_and_ticket_only_staff_are_never_matched() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    engine
        .presence
        .set_mode("alice", WorkMode::TicketOnly)
        .await
        .unwrap();

    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    assert_eq!(session.status, SessionStatus::Waiting);

    engine.presence.set_mode("alice", WorkMode::Away).await.unwrap();
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Waiting);

    engine.presence.set_mode("alice", WorkMode::Working).await.unwrap();
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Active);
}

#[tokio::test]
async fn test_department_filter_and_explicit_fallback() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    engine
        .presence
        .update_preferences(
            "alice",
            StaffPreferences {
                preferred_departments: Some(vec!["billing".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut details = guest("Sam");
    details.department = Some("sales".to_string());
    let session = engine.sessions.start_session(details.clone()).await.unwrap();
    assert_eq!(session.status, SessionStatus::Waiting);

    let (fallback_engine, _rx) = engine_with(RecoverySettings {
        department_fallback: true,
        ..Default::default()
    });
    online_staff(&fallback_engine, "alice", 3).await;
    fallback_engine
        .presence
        .update_preferences(
            "alice",
            StaffPreferences {
                preferred_departments: Some(vec!["billing".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let session = fallback_engine.sessions.start_session(details).await.unwrap();
    assert_eq!(session.assigned_to.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_vip_sessions_need_vip_staff() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;

    let mut details = guest("Vera");
    details.priority = ChatPriority::Vip;
    let session = engine.sessions.start_session(details).await.unwrap();
    assert_eq!(session.status, SessionStatus::Waiting);

    engine
        .presence
        .update_preferences(
            "alice",
            StaffPreferences {
                accepts_vip: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Active);
}

#[tokio::test]
async fn test_assigning_ended_session_is_rejected() {
    let (engine, _rx) = engine();
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    engine
        .sessions
        .end_session(session.id, EndedBy::Guest)
        .await
        .unwrap();

    let result = engine.coordinator.assign(session.id).await;
    assert!(matches!(result, Err(EngineError::SessionEnded(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignment_yields_single_winner() {
    let (engine, _rx) = engine();
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    for name in ["alice", "bob", "carol", "dave"] {
        quietly_available(&engine, name, 3).await;
    }

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.coordinator.assign(session.id).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            AssignOutcome::Assigned { .. } => winners += 1,
            AssignOutcome::NotAssigned(reason) => {
                assert_eq!(reason, NotAssignedReason::AlreadyAssigned)
            }
        }
    }
    assert_eq!(winners, 1);

    let session = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.assigned_to.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_respect_capacity() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 2).await;
    online_staff(&engine, "bob", 1).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .sessions
                .start_session(guest(&format!("Guest{i}")))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(active_count(&engine, "alice").await, 2);
    assert_eq!(active_count(&engine, "bob").await, 1);

    let waiting = engine
        .store()
        .get_waiting_sessions(&Default::default())
        .await
        .unwrap();
    assert_eq!(waiting.len(), 5);
    let positions: Vec<i32> = waiting.iter().map(|s| s.queue_position).collect();
    assert_eq!(positions, vec![1, 2, 3, 4, 5]);
}

// ============================================================================
// Staff disconnect and recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_requeue_after_grace_period_boosts_priority() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    drain(&mut rx);

    assert!(engine.presence.connection_closed("alice").await.unwrap());
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::StaffDisconnected);

    advance(29).await;
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::StaffDisconnected);

    advance(2).await;
    let requeued = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(requeued.status, SessionStatus::Waiting);
    assert_eq!(requeued.staff_disconnect_count, 1);
    assert_eq!(requeued.priority, ChatPriority::High);
    assert_eq!(requeued.assigned_to, None);
    assert_eq!(requeued.previously_assigned_to.as_deref(), Some("alice"));
    assert!(!requeued.is_escalated);

    let events = drain(&mut rx);
    let requeue = events.iter().find_map(|e| match e {
        ChatEvent::SessionRequeued {
            new_priority,
            new_queue_position,
            guest_message,
            ..
        } => Some((*new_priority, *new_queue_position, guest_message.clone())),
        _ => None,
    });
    let (priority, position, message) = requeue.expect("session_requeued event");
    assert_eq!(priority, ChatPriority::High);
    assert_eq!(position, 1);
    assert_eq!(message, RecoverySettings::default().staff_disconnect_message);

    let history = engine.sessions.message_history(session.id).await.unwrap();
    assert!(history
        .iter()
        .any(|m| m.content == RecoverySettings::default().staff_disconnect_message));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_grace_resumes_session() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    engine.presence.connection_closed("alice").await.unwrap();
    advance(10).await;
    assert!(engine.presence.connection_opened("alice").await.unwrap());

    let resumed = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Active);
    assert_eq!(resumed.assigned_to.as_deref(), Some("alice"));
    assert!(!engine
        .timers()
        .is_scheduled(session.id, TimerKind::GracePeriod));

    advance(30).await;
    let later = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(later.status, SessionStatus::Active);
    assert_eq!(later.staff_disconnect_count, 0);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::SessionResumed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_second_disconnect_cycle_escalates() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    // First cycle: boosted to high
    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;
    assert_eq!(
        engine.sessions.get(session.id).await.unwrap().priority,
        ChatPriority::High
    );

    // alice returns and picks it up again
    engine.presence.connection_opened("alice").await.unwrap();
    let reassigned = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(reassigned.status, SessionStatus::Active);
    drain(&mut rx);

    // Second cycle reaches the threshold
    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;

    let escalated = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(escalated.status, SessionStatus::Waiting);
    assert_eq!(escalated.staff_disconnect_count, 2);
    assert_eq!(escalated.priority, ChatPriority::Urgent);
    assert!(escalated.is_escalated);

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        ChatEvent::SessionEscalated {
            priority: ChatPriority::Urgent,
            ..
        }
    )));

    let supervisor_view = engine.sessions.list_escalated().await.unwrap();
    assert_eq!(supervisor_view.len(), 1);
    assert_eq!(supervisor_view[0].id, session.id);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_applies_under_every_requeue_policy() {
    for policy in [
        RequeuePolicy::Front,
        RequeuePolicy::PriorityBoost,
        RequeuePolicy::Original,
        RequeuePolicy::End,
    ] {
        let (engine, _rx) = engine_with(RecoverySettings {
            requeue_position: policy,
            max_disconnects_before_escalation: 1,
            ..Default::default()
        });
        online_staff(&engine, "alice", 3).await;
        let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

        engine.presence.connection_closed("alice").await.unwrap();
        advance(31).await;

        let session = engine.sessions.get(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Waiting, "policy {policy:?}");
        assert_eq!(session.priority, ChatPriority::Urgent, "policy {policy:?}");
        assert!(session.is_escalated, "policy {policy:?}");
        engine.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_front_policy_requeues_at_head() {
    let (engine, _rx) = engine_with(RecoverySettings {
        requeue_position: RequeuePolicy::Front,
        ..Default::default()
    });
    online_staff(&engine, "alice", 1).await;
    let assigned = engine.sessions.start_session(guest("One")).await.unwrap();
    let waiting = engine.sessions.start_session(guest("Two")).await.unwrap();
    assert_eq!(assigned.status, SessionStatus::Active);

    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;

    let requeued = engine.sessions.get(assigned.id).await.unwrap();
    assert_eq!(requeued.queue_position, 1);
    assert_eq!(requeued.priority, ChatPriority::Normal);
    assert_eq!(engine.sessions.get(waiting.id).await.unwrap().queue_position, 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_disconnect_is_noop() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    assert_eq!(engine.supervisor.staff_disconnected("alice").await.unwrap(), 1);
    advance(10).await;
    assert_eq!(engine.supervisor.staff_disconnected("alice").await.unwrap(), 0);
    assert!(!engine.supervisor.begin_grace(session.id, "alice").await.unwrap());

    // The first timer is kept: requeue happens 30s after the first signal
    advance(21).await;
    let requeued = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(requeued.status, SessionStatus::Waiting);
    assert_eq!(requeued.staff_disconnect_count, 1);
    assert_eq!(requeued.priority, ChatPriority::High);

    // A stale expiry after the fact changes nothing
    assert!(engine
        .supervisor
        .handle_grace_expired(session.id, None)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        engine
            .sessions
            .get(session.id)
            .await
            .unwrap()
            .staff_disconnect_count,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_from_earlier_disconnect_is_ignored() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    engine.presence.connection_closed("alice").await.unwrap();
    let first = engine.sessions.get(session.id).await.unwrap().disconnected_at;
    assert!(first.is_some());

    // Back within grace, then lost again
    engine.presence.connection_opened("alice").await.unwrap();
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Active);
    engine.presence.connection_closed("alice").await.unwrap();
    let second = engine.sessions.get(session.id).await.unwrap().disconnected_at;
    assert_ne!(first, second);

    // The first disconnect's expiry lands late and must not requeue
    assert!(engine
        .supervisor
        .handle_grace_expired(session.id, first)
        .await
        .unwrap()
        .is_none());
    let held = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(held.status, SessionStatus::StaffDisconnected);
    assert_eq!(held.staff_disconnect_count, 0);

    // The second disconnect still gets its full window
    advance(29).await;
    assert_eq!(
        status_of(&engine, session.id).await,
        SessionStatus::StaffDisconnected
    );
    advance(2).await;
    let requeued = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(requeued.status, SessionStatus::Waiting);
    assert_eq!(requeued.staff_disconnect_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_in_grace_hold_staff_capacity() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 1).await;
    let held = engine.sessions.start_session(guest("One")).await.unwrap();
    assert_eq!(held.status, SessionStatus::Active);

    engine.presence.connection_closed("alice").await.unwrap();
    assert_eq!(
        status_of(&engine, held.id).await,
        SessionStatus::StaffDisconnected
    );

    // alice reads as online again before her held session has resumed
    quietly_available(&engine, "alice", 1).await;
    let newcomer = engine.sessions.start_session(guest("Two")).await.unwrap();
    assert_eq!(newcomer.status, SessionStatus::Waiting);

    let resumed = engine.supervisor.staff_reconnected("alice").await.unwrap();
    assert_eq!(resumed, vec![held.id]);
    assert_eq!(active_count(&engine, "alice").await, 1);
    assert_eq!(status_of(&engine, newcomer.id).await, SessionStatus::Waiting);
}

#[tokio::test(start_paused = true)]
async fn test_auto_reassign_picks_up_requeued_session() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Waiting);

    // bob appears without any presence trigger
    quietly_available(&engine, "bob", 3).await;
    drain(&mut rx);

    advance(61).await;
    let picked = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(picked.status, SessionStatus::Active);
    assert_eq!(picked.assigned_to.as_deref(), Some("bob"));

    let message = drain(&mut rx).into_iter().find_map(|e| match e {
        ChatEvent::SessionAssigned { guest_message, .. } => guest_message,
        _ => None,
    });
    assert_eq!(
        message.as_deref(),
        Some(RecoverySettings::default().reassignment_message.as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn test_prefer_previous_staff_within_window() {
    let (engine, _rx) = engine_with(RecoverySettings {
        prefer_previous_staff: true,
        ..Default::default()
    });
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;

    // bob has been idle longer, so he would normally win
    quietly_available(&engine, "bob", 3).await;
    std::thread::sleep(Duration::from_millis(5));
    engine.presence.connection_opened("alice").await.unwrap();

    let session = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(session.assigned_to.as_deref(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_without_preference_longest_idle_wins() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;

    quietly_available(&engine, "bob", 3).await;
    std::thread::sleep(Duration::from_millis(5));
    engine.presence.connection_opened("alice").await.unwrap();

    let session = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(session.assigned_to.as_deref(), Some("bob"));
}

// ============================================================================
// Guest inactivity and recovery
// ============================================================================

fn short_inactivity() -> RecoverySettings {
    RecoverySettings {
        guest_inactivity_timeout_minutes: 1,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_guest_activity_postpones_abandonment() {
    let (engine, mut rx) = engine_with(short_inactivity());
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();

    advance(40).await;
    engine
        .sessions
        .post_guest_message(session.id, "still there?")
        .await
        .unwrap();

    advance(40).await;
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Waiting);

    advance(30).await;
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Abandoned);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::SessionAbandoned { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_watch_survives_staff_disconnect() {
    let (engine, _rx) = engine_with(short_inactivity());
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);

    advance(45).await;
    engine.presence.connection_closed("alice").await.unwrap();

    // Inactivity deadline passes while the session waits on alice
    advance(20).await;
    assert_eq!(
        status_of(&engine, session.id).await,
        SessionStatus::StaffDisconnected
    );
    assert!(engine
        .timers()
        .is_scheduled(session.id, TimerKind::GuestInactivity));

    // Grace runs out and nobody is left to take the session
    advance(15).await;
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Waiting);

    advance(60).await;
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Abandoned);
}

#[tokio::test]
async fn test_guest_activity_after_end_is_rejected() {
    let (engine, _rx) = engine_with(short_inactivity());
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    engine
        .sessions
        .end_session(session.id, EndedBy::Guest)
        .await
        .unwrap();
    let ended = engine.sessions.get(session.id).await.unwrap();

    let touched = engine.supervisor.record_guest_activity(session.id).await;
    assert!(matches!(touched, Err(EngineError::SessionEnded(_))));
    assert!(!engine
        .timers()
        .is_scheduled(session.id, TimerKind::GuestInactivity));

    let after = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Ended);
    assert_eq!(after.last_guest_activity_at, ended.last_guest_activity_at);
    assert_eq!(after.version, ended.version);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_session_recovered_at_front() {
    let (engine, mut rx) = engine_with(short_inactivity());
    let bob = engine
        .sessions
        .start_session(GuestDetails {
            guest_name: "Bob".to_string(),
            guest_email: "bob@x.com".to_string(),
            department: None,
            priority: ChatPriority::Normal,
        })
        .await
        .unwrap();
    engine
        .sessions
        .post_guest_message(bob.id, "hello")
        .await
        .unwrap();

    advance(61).await;
    assert_eq!(status_of(&engine, bob.id).await, SessionStatus::Abandoned);

    let other = engine.sessions.start_session(guest("Other")).await.unwrap();
    assert_eq!(other.queue_position, 1);
    drain(&mut rx);

    let recovered = engine
        .recovery
        .reconnect("bob", "BOB@x.com", Some(2))
        .await
        .unwrap()
        .expect("recoverable session");

    assert_eq!(recovered.session.id, bob.id);
    assert_eq!(recovered.session.status, SessionStatus::Waiting);
    assert_eq!(recovered.session.queue_position, 1);
    assert_eq!(recovered.session.recovery_attempts, 1);
    assert_eq!(engine.sessions.get(other.id).await.unwrap().queue_position, 2);

    let contents: Vec<&str> = recovered
        .message_history
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents.len(), 2);
    assert_eq!(contents[0], "hello");
    assert!(contents[1].starts_with("Guest reconnected after"));

    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::SessionRecovered { session_id, .. } if *session_id == bob.id)));
}

#[tokio::test]
async fn test_reconnect_twice_returns_same_session() {
    let (engine, _rx) = engine();
    let original = engine.sessions.start_session(guest("Bob")).await.unwrap();

    let first = engine
        .recovery
        .reconnect("Bob", "bob@example.com", Some(2))
        .await
        .unwrap()
        .unwrap();
    let second = engine
        .recovery
        .reconnect("Bob", "bob@example.com", Some(2))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.session.id, original.id);
    assert_eq!(second.session.id, original.id);
    assert_eq!(second.session.recovery_attempts, 2);
    assert_eq!(second.session.queue_position, 1);
}

#[tokio::test]
async fn test_reconnecting_to_active_session_keeps_agent() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let original = engine.sessions.start_session(guest("Bob")).await.unwrap();
    assert_eq!(original.status, SessionStatus::Active);

    let recovered = engine
        .recovery
        .reconnect("Bob", "bob@example.com", Some(2))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(recovered.session.id, original.id);
    assert_eq!(recovered.session.status, SessionStatus::Active);
    assert_eq!(recovered.session.assigned_to.as_deref(), Some("alice"));
    assert_eq!(recovered.session.recovery_attempts, 1);
}

#[tokio::test]
async fn test_reconnect_without_match_is_none() {
    let (engine, _rx) = engine();
    engine.sessions.start_session(guest("Bob")).await.unwrap();

    let found = engine
        .recovery
        .reconnect("Robert", "bob@example.com", None)
        .await
        .unwrap();
    assert!(found.is_none());

    let result = engine.recovery.reconnect("Bob", "bob@example.com", Some(0)).await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));
}

#[tokio::test(start_paused = true)]
async fn test_recovering_disconnected_session_cancels_grace() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    engine.presence.connection_closed("alice").await.unwrap();

    let recovered = engine
        .recovery
        .resume_by_token(&session.recovery_token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.session.status, SessionStatus::Waiting);
    assert_eq!(recovered.session.previously_assigned_to.as_deref(), Some("alice"));

    advance(31).await;
    let later = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(later.status, SessionStatus::Waiting);
    assert_eq!(later.staff_disconnect_count, 0);
    assert_eq!(later.priority, ChatPriority::Normal);
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_ending_frees_capacity_for_next_guest() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 1).await;
    let first = engine.sessions.start_session(guest("One")).await.unwrap();
    let second = engine.sessions.start_session(guest("Two")).await.unwrap();
    assert_eq!(second.status, SessionStatus::Waiting);

    engine
        .sessions
        .end_session(first.id, EndedBy::Staff("alice".to_string()))
        .await
        .unwrap();

    assert_eq!(status_of(&engine, first.id).await, SessionStatus::Ended);
    assert_eq!(status_of(&engine, second.id).await, SessionStatus::Active);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::SessionEnded { session_id } if *session_id == first.id)));

    let again = engine.sessions.end_session(first.id, EndedBy::Guest).await;
    assert!(matches!(again, Err(EngineError::SessionEnded(_))));
    let message = engine.sessions.post_guest_message(first.id, "hi").await;
    assert!(matches!(message, Err(EngineError::SessionEnded(_))));
}

#[tokio::test]
async fn test_only_assignee_posts_staff_messages() {
    let (engine, mut rx) = engine();
    online_staff(&engine, "alice", 3).await;
    online_staff(&engine, "bob", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    let assignee = session.assigned_to.clone().unwrap();
    let other = if assignee == "alice" { "bob" } else { "alice" };

    let message = engine
        .sessions
        .post_staff_message(session.id, &assignee, "How can I help?")
        .await
        .unwrap();
    assert_eq!(message.sender_name.as_deref(), Some(assignee.to_uppercase().as_str()));

    let rejected = engine
        .sessions
        .post_staff_message(session.id, other, "Hi")
        .await;
    assert!(matches!(rejected, Err(EngineError::InvalidState(_))));

    engine
        .sessions
        .post_guest_message(session.id, "My order is late")
        .await
        .unwrap();
    let history = engine.sessions.message_history(session.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::MessagePosted { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_admin_reset_clears_escalation() {
    let (engine, _rx) = engine_with(RecoverySettings {
        max_disconnects_before_escalation: 1,
        ..Default::default()
    });
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    engine.presence.connection_closed("alice").await.unwrap();
    advance(31).await;
    assert!(engine.sessions.get(session.id).await.unwrap().is_escalated);

    let reset = engine.sessions.admin_reset(session.id).await.unwrap();
    assert_eq!(reset.staff_disconnect_count, 0);
    assert_eq!(reset.priority, ChatPriority::Normal);
    assert!(!reset.is_escalated);
    assert!(engine.sessions.list_escalated().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deactivated_staff_never_matched() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    engine.presence.deactivate("alice").await.unwrap();

    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    assert_eq!(session.status, SessionStatus::Waiting);
    assert!(!engine.presence.get("alice").await.unwrap().unwrap().is_active);
}

// ============================================================================
// Backstop sweeps
// ============================================================================

#[tokio::test]
async fn test_sweeps_recover_lost_timers() {
    let (engine, _rx) = engine();
    online_staff(&engine, "alice", 3).await;
    let session = engine.sessions.start_session(guest("Sam")).await.unwrap();
    engine.presence.connection_closed("alice").await.unwrap();

    // Simulate a restart that lost every in-process timer
    engine.timers().shutdown();

    let now = time::OffsetDateTime::now_utc();
    assert_eq!(engine.supervisor.sweep_expired_grace(now).await.unwrap(), 0);

    let later = now + time::Duration::seconds(31);
    assert_eq!(engine.supervisor.sweep_expired_grace(later).await.unwrap(), 1);
    let requeued = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(requeued.status, SessionStatus::Waiting);
    assert_eq!(requeued.staff_disconnect_count, 1);

    // Running it again is a no-op
    assert_eq!(engine.supervisor.sweep_expired_grace(later).await.unwrap(), 0);

    quietly_available(&engine, "bob", 3).await;
    let much_later = later + time::Duration::seconds(120);
    assert_eq!(engine.supervisor.sweep_stale_requeued(much_later).await.unwrap(), 1);
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Active);

    let idle = much_later + time::Duration::minutes(31);
    assert_eq!(engine.supervisor.sweep_inactive(idle).await.unwrap(), 1);
    assert_eq!(status_of(&engine, session.id).await, SessionStatus::Abandoned);
    assert_eq!(active_count(&engine, "bob").await, 0);
}
