//! Integration tests for the Postgres chat store
//!
//! Exercise the SQL implementation of the store guarantees: queue
//! contiguity, the conditional assignment critical section and the
//! version-checked session write.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/deskchat_test"
//! cargo test -p deskchat-engine --test postgres_store -- --ignored
//! ```
//!
//! Every test truncates the chat tables, so point DATABASE_URL at a
//! throwaway database.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use deskchat_engine::store::{AssignWrite, QueuePlacement, StaffAvailabilityUpdate, WaitingFilter};
use deskchat_engine::{ChatStore, EngineError, PgChatStore, RecoverySettings};
use deskchat_engine::models::NewSession;
use deskchat_shared::{ChatPriority, MessageSender, RequeuePolicy, SessionId, SessionStatus, WorkMode};
use serial_test::serial;
use std::sync::Arc;

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup() -> PgChatStore {
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for integration tests");
    let pool = deskchat_shared::create_pool(&database_url, 5)
        .await
        .expect("Failed to connect to test database");
    deskchat_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query(
        "TRUNCATE chat_messages, chat_sessions, chat_staff_availability, chat_recovery_settings",
    )
    .execute(&pool)
    .await
    .expect("Failed to reset tables");

    PgChatStore::new(pool)
}

fn new_session(name: &str) -> NewSession {
    NewSession {
        id: SessionId::new(),
        recovery_token: format!("token-{}", SessionId::new()),
        guest_name: name.to_string(),
        guest_email: format!("{}@example.com", name.to_lowercase()),
        department: None,
        priority: ChatPriority::Normal,
    }
}

async fn ready_staff(store: &PgChatStore, username: &str, max_chats: i32) {
    store
        .upsert_staff_availability(
            username,
            &StaffAvailabilityUpdate {
                display_name: Some(username.to_string()),
                mode: Some(WorkMode::Ready),
                max_concurrent_chats: Some(max_chats),
                is_online: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

async fn waiting_positions(store: &PgChatStore) -> Vec<(SessionId, i32)> {
    store
        .get_waiting_sessions(&WaitingFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.id, s.queue_position))
        .collect()
}

// ============================================================================
// Queue and assignment
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_insert_appends_and_assign_closes_gap() {
    let store = setup().await;
    ready_staff(&store, "alice", 3).await;

    let a = store.insert_session(new_session("A")).await.unwrap();
    let b = store.insert_session(new_session("B")).await.unwrap();
    let c = store.insert_session(new_session("C")).await.unwrap();
    assert_eq!(
        (a.queue_position, b.queue_position, c.queue_position),
        (1, 2, 3)
    );

    let AssignWrite::Assigned(assigned) = store.conditional_assign(b.id, "alice").await.unwrap()
    else {
        panic!("expected assignment");
    };
    assert_eq!(assigned.status, SessionStatus::Active);
    assert_eq!(assigned.original_queue_position, Some(2));

    assert_eq!(waiting_positions(&store).await, vec![(a.id, 1), (c.id, 2)]);

    // Second attempt on the same session loses
    assert!(matches!(
        store.conditional_assign(b.id, "alice").await.unwrap(),
        AssignWrite::SessionNotWaiting
    ));
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_capacity_rechecked_inside_assignment() {
    let store = setup().await;
    ready_staff(&store, "alice", 1).await;

    let a = store.insert_session(new_session("A")).await.unwrap();
    let b = store.insert_session(new_session("B")).await.unwrap();

    assert!(matches!(
        store.conditional_assign(a.id, "alice").await.unwrap(),
        AssignWrite::Assigned(_)
    ));
    assert!(matches!(
        store.conditional_assign(b.id, "alice").await.unwrap(),
        AssignWrite::StaffAtCapacity
    ));

    store
        .upsert_staff_availability(
            "alice",
            &StaffAvailabilityUpdate {
                mode: Some(WorkMode::Away),
                max_concurrent_chats: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        store.conditional_assign(b.id, "alice").await.unwrap(),
        AssignWrite::StaffUnavailable
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
#[serial]
async fn test_concurrent_assignment_single_winner() {
    let store = Arc::new(setup().await);
    for name in ["alice", "bob", "carol"] {
        ready_staff(&store, name, 3).await;
    }
    let session = store.insert_session(new_session("A")).await.unwrap();

    let mut handles = Vec::new();
    for name in ["alice", "bob", "carol", "alice", "bob", "carol"] {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.conditional_assign(session.id, name).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if let AssignWrite::Assigned(_) = handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_versioned_update_and_requeue_placement() {
    let store = setup().await;
    ready_staff(&store, "alice", 3).await;

    let a = store.insert_session(new_session("A")).await.unwrap();
    let b = store.insert_session(new_session("B")).await.unwrap();
    let c = store.insert_session(new_session("C")).await.unwrap();
    let AssignWrite::Assigned(active) = store.conditional_assign(a.id, "alice").await.unwrap()
    else {
        panic!("expected assignment");
    };

    let mut requeued = active.clone();
    requeued.status = SessionStatus::Waiting;
    requeued.previously_assigned_to = requeued.assigned_to.take();
    requeued.staff_disconnect_count = 1;

    let written = store
        .update_session(&requeued, active.version, QueuePlacement::Front)
        .await
        .unwrap()
        .expect("version matches");
    assert_eq!(written.queue_position, 1);
    assert_eq!(written.version, active.version + 1);
    assert_eq!(
        waiting_positions(&store).await,
        vec![(a.id, 1), (b.id, 2), (c.id, 3)]
    );

    // Stale version is rejected
    let conflict = store
        .update_session(&requeued, active.version, QueuePlacement::Unchanged)
        .await
        .unwrap();
    assert!(conflict.is_none());
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_available_staff_counts_active_chats() {
    let store = setup().await;
    ready_staff(&store, "alice", 3).await;
    ready_staff(&store, "bob", 3).await;
    store
        .upsert_staff_availability(
            "carol",
            &StaffAvailabilityUpdate {
                display_name: Some("carol".to_string()),
                mode: Some(WorkMode::TicketOnly),
                is_online: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let a = store.insert_session(new_session("A")).await.unwrap();
    store.conditional_assign(a.id, "alice").await.unwrap();

    let mut available = store.get_available_staff().await.unwrap();
    available.sort_by(|x, y| x.staff.username.cmp(&y.staff.username));
    let counts: Vec<(&str, i64)> = available
        .iter()
        .map(|c| (c.staff.username.as_str(), c.active_chats))
        .collect();
    assert_eq!(counts, vec![("alice", 1), ("bob", 0)]);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_session_in_grace_holds_capacity() {
    let store = setup().await;
    ready_staff(&store, "alice", 1).await;
    let held = store.insert_session(new_session("A")).await.unwrap();
    let next = store.insert_session(new_session("B")).await.unwrap();

    let assigned = match store.conditional_assign(held.id, "alice").await.unwrap() {
        AssignWrite::Assigned(s) => s,
        other => panic!("Expected Assigned, got {:?}", other),
    };
    let mut in_grace = assigned.clone();
    in_grace.status = SessionStatus::StaffDisconnected;
    in_grace.disconnected_at = Some(time::OffsetDateTime::now_utc());
    store
        .update_session(&in_grace, assigned.version, QueuePlacement::Unchanged)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        store.conditional_assign(next.id, "alice").await.unwrap(),
        AssignWrite::StaffAtCapacity
    ));
    let available = store.get_available_staff().await.unwrap();
    assert_eq!(available[0].active_chats, 1);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_touch_guest_activity_rejects_ended_session() {
    let store = setup().await;
    let s = store.insert_session(new_session("A")).await.unwrap();
    assert!(store.touch_guest_activity(s.id).await.unwrap().is_some());

    let mut ended = store.get_session(s.id).await.unwrap().unwrap();
    let version = ended.version;
    ended.status = SessionStatus::Ended;
    ended.ended_at = Some(time::OffsetDateTime::now_utc());
    store
        .update_session(&ended, version, QueuePlacement::Unchanged)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        store.touch_guest_activity(s.id).await,
        Err(EngineError::SessionEnded(_))
    ));
    assert!(store
        .touch_guest_activity(SessionId::new())
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Recovery lookup, messages and settings
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_recovery_lookup_is_case_insensitive() {
    let store = setup().await;
    let session = store.insert_session(new_session("Bob")).await.unwrap();
    let since = time::OffsetDateTime::now_utc() - time::Duration::hours(2);

    let found = store
        .find_recoverable_session("BOB", "Bob@Example.com", since)
        .await
        .unwrap()
        .expect("session found");
    assert_eq!(found.id, session.id);

    let by_token = store
        .get_session_by_token(&session.recovery_token)
        .await
        .unwrap()
        .expect("session found by token");
    assert_eq!(by_token.id, session.id);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_messages_and_settings_round_trip() {
    let store = setup().await;
    let session = store.insert_session(new_session("A")).await.unwrap();

    store
        .append_message(session.id, MessageSender::Guest, Some("A"), "first")
        .await
        .unwrap();
    store
        .append_message(session.id, MessageSender::System, None, "second")
        .await
        .unwrap();
    let contents: Vec<String> = store
        .list_messages(session.id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first", "second"]);

    assert!(store.load_recovery_settings().await.unwrap().is_none());
    let settings = RecoverySettings {
        requeue_position: RequeuePolicy::Original,
        ..Default::default()
    };
    store.save_recovery_settings(&settings).await.unwrap();
    assert_eq!(store.load_recovery_settings().await.unwrap(), Some(settings));
}
