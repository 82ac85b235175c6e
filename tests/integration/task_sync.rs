//! Integration tests for the task sync controller.
//!
//! Drives [`TaskSyncController`] through the in-memory session provider and
//! store: sign-in lifecycle, ordering, per-user isolation, validation, and
//! failure handling.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use tasklist::session::SessionProvider;
use tasklist::session::memory::MemorySessionProvider;
use tasklist::store::memory::MemoryTaskStore;
use tasklist::store::{StoreError, TaskStore};
use tasklist::sync::{Mutation, SyncError, SyncState, SyncView, TaskSyncController};
use tasklist_proto::task::{Identity, NewTask, TaskId};
use tasklist_proto::wire::FederatedProvider;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryTaskStore>,
    session: Arc<MemorySessionProvider>,
    controller: Arc<TaskSyncController<MemoryTaskStore>>,
    view: watch::Receiver<SyncView>,
    _follower: tokio::task::JoinHandle<()>,
}

fn harness_with(store: MemoryTaskStore) -> Harness {
    let store = Arc::new(store);
    let session = Arc::new(MemorySessionProvider::new());
    let controller = Arc::new(TaskSyncController::new(Arc::clone(&store)));
    let follower = controller.follow(session.as_ref());
    let view = controller.view();
    Harness {
        store,
        session,
        controller,
        view,
        _follower: follower,
    }
}

fn harness() -> Harness {
    harness_with(MemoryTaskStore::new())
}

/// Waits until the view satisfies `pred` and returns it.
async fn settle(rx: &mut watch::Receiver<SyncView>, pred: impl FnMut(&SyncView) -> bool) -> SyncView {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for view")
        .expect("controller dropped")
        .clone()
}

/// Waits for a live projection belonging to `identity`.
async fn live_for(h: &mut Harness, identity: &Identity) -> SyncView {
    let identity = identity.clone();
    settle(&mut h.view, move |v| {
        v.state == SyncState::Live && v.identity.as_ref() == Some(&identity)
    })
    .await
}

fn texts(view: &SyncView) -> Vec<&str> {
    view.tasks.iter().map(|t| t.text.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_toggle_delete_round_trip() {
    let mut h = harness();
    let me = h
        .session
        .sign_up_password("u1@example.com", "secret1")
        .await
        .unwrap();
    let view = live_for(&mut h, &me).await;
    assert!(view.tasks.is_empty());

    let id = h.controller.add_task("Buy milk").await.unwrap();
    let view = settle(&mut h.view, |v| v.tasks.len() == 1).await;
    assert_eq!(view.tasks[0].id, id);
    assert_eq!(view.tasks[0].text, "Buy milk");
    assert!(!view.tasks[0].completed);
    assert_eq!(view.tasks[0].owner, me);

    h.controller.toggle_task(&id).await.unwrap();
    let view = settle(&mut h.view, |v| v.tasks.first().is_some_and(|t| t.completed)).await;
    assert_eq!(view.tasks.len(), 1);

    h.controller.toggle_task(&id).await.unwrap();
    settle(&mut h.view, |v| v.tasks.first().is_some_and(|t| !t.completed)).await;

    h.controller.delete_task(&id).await.unwrap();
    let view = settle(&mut h.view, |v| v.tasks.is_empty()).await;
    assert_eq!(view.state, SyncState::Live);
}

#[tokio::test]
async fn tasks_are_projected_newest_first() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;

    for text in ["t1", "t2", "t3"] {
        h.controller.add_task(text).await.unwrap();
    }
    let view = settle(&mut h.view, |v| v.tasks.len() == 3).await;
    assert_eq!(texts(&view), ["t3", "t2", "t1"]);
    assert!(view.tasks.windows(2).all(|w| w[0].created_at > w[1].created_at));
}

#[tokio::test]
async fn text_is_trimmed_before_storing() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;

    h.controller.add_task("   Walk dog  ").await.unwrap();
    let view = settle(&mut h.view, |v| v.tasks.len() == 1).await;
    assert_eq!(view.tasks[0].text, "Walk dog");
}

#[tokio::test]
async fn existing_tasks_load_on_sign_in() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;
    h.controller.add_task("from last session").await.unwrap();
    settle(&mut h.view, |v| v.tasks.len() == 1).await;

    h.session.sign_out().await.unwrap();
    settle(&mut h.view, |v| v.state == SyncState::Unsubscribed).await;

    h.session
        .sign_in_password("u@example.com", "secret1")
        .await
        .unwrap();
    let view = settle(&mut h.view, |v| v.state == SyncState::Live && v.tasks.len() == 1).await;
    assert_eq!(texts(&view), ["from last session"]);
}

// ---------------------------------------------------------------------------
// Sign-out and identity switches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sign_out_clears_projection_and_cancels_query() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;
    h.controller.add_task("secret plans").await.unwrap();
    settle(&mut h.view, |v| v.tasks.len() == 1).await;

    h.session.sign_out().await.unwrap();
    let view = settle(&mut h.view, |v| v.state == SyncState::Unsubscribed).await;
    assert!(view.tasks.is_empty());
    assert!(view.identity.is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.store.live_queries(), 0);
}

#[tokio::test]
async fn writes_after_sign_out_never_reach_projection() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;

    h.session.sign_out().await.unwrap();
    settle(&mut h.view, |v| v.state == SyncState::Unsubscribed).await;

    // Another session of the same user keeps writing.
    h.store
        .create(NewTask::new("written elsewhere".to_string(), me.clone()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = h.controller.snapshot();
    assert_eq!(view.state, SyncState::Unsubscribed);
    assert!(view.tasks.is_empty());
}

#[tokio::test]
async fn switching_users_replaces_projection() {
    let mut h = harness();
    let ann = h.session.sign_up_password("ann@example.com", "secret1").await.unwrap();
    live_for(&mut h, &ann).await;
    h.controller.add_task("ann's task").await.unwrap();
    settle(&mut h.view, |v| v.tasks.len() == 1).await;

    // Sign in as someone else without signing out first.
    let bob = h.session.sign_up_password("bob@example.com", "secret1").await.unwrap();
    let view = live_for(&mut h, &bob).await;
    assert!(view.tasks.is_empty());

    h.controller.add_task("bob's task").await.unwrap();
    let view = settle(&mut h.view, |v| v.tasks.len() == 1).await;
    assert_eq!(texts(&view), ["bob's task"]);
    assert!(view.tasks.iter().all(|t| t.owner == bob));
}

#[tokio::test]
async fn users_never_see_each_others_tasks() {
    let mut h = harness();
    let ann = h.session.sign_up_password("ann@example.com", "secret1").await.unwrap();
    live_for(&mut h, &ann).await;
    h.controller.add_task("ann only").await.unwrap();
    settle(&mut h.view, |v| v.tasks.len() == 1).await;
    h.session.sign_out().await.unwrap();

    let bob = h
        .session
        .sign_in_federated(FederatedProvider::Google, "google-sub-bob")
        .await
        .unwrap();
    let view = live_for(&mut h, &bob).await;
    assert!(view.tasks.is_empty());
    assert!(h.store.tasks_of(&bob).is_empty());
    assert_eq!(h.store.tasks_of(&ann).len(), 1);
}

// ---------------------------------------------------------------------------
// Validation and mutation failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_text_is_rejected_before_store() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;

    assert_eq!(h.controller.add_task("").await, Err(SyncError::EmptyText));
    assert_eq!(h.controller.add_task("   ").await, Err(SyncError::EmptyText));
    assert_eq!(
        h.controller.add_task(&"x".repeat(101)).await,
        Err(SyncError::TextTooLong)
    );
    assert!(h.controller.add_task(&"x".repeat(100)).await.is_ok());
    assert_eq!(h.store.write_calls(), 1);
}

#[tokio::test]
async fn unknown_id_is_rejected_and_projection_unchanged() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;
    h.controller.add_task("keep me").await.unwrap();
    let before = settle(&mut h.view, |v| v.tasks.len() == 1).await;

    let missing = TaskId::new();
    assert_eq!(
        h.controller.delete_task(&missing).await,
        Err(SyncError::TaskNotFound(missing.clone()))
    );
    assert_eq!(
        h.controller.toggle_task(&missing).await,
        Err(SyncError::TaskNotFound(missing))
    );
    assert_eq!(h.store.write_calls(), 1);
    assert_eq!(h.controller.snapshot(), before);
}

#[tokio::test]
async fn store_failure_leaves_projection_unchanged() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;
    let id = h.controller.add_task("existing").await.unwrap();
    let before = settle(&mut h.view, |v| v.tasks.len() == 1).await;

    h.store.set_write_failure(Some(StoreError::PermissionDenied));
    let err = h.controller.add_task("refused").await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Store {
            op: Mutation::Add,
            source: StoreError::PermissionDenied
        }
    );
    assert_eq!(err.user_message(), "Failed to add task: permission denied");

    let err = h.controller.toggle_task(&id).await.unwrap_err();
    assert_eq!(err.user_message(), "Failed to update task: permission denied");
    let err = h.controller.delete_task(&id).await.unwrap_err();
    assert_eq!(err.user_message(), "Failed to delete task: permission denied");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.controller.snapshot(), before);
}

#[tokio::test]
async fn toggle_of_task_deleted_elsewhere_reports_failure() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;
    let id = h.controller.add_task("contested").await.unwrap();
    settle(&mut h.view, |v| v.tasks.len() == 1).await;

    // Deleted by another session before our projection catches up.
    h.store.delete(&id).await.unwrap();
    let err = h.controller.toggle_task(&id).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Store {
            op: Mutation::Toggle,
            source: StoreError::NotFound(id)
        }
    );

    settle(&mut h.view, |v| v.tasks.is_empty()).await;
}

// ---------------------------------------------------------------------------
// Subscription failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broken_query_shows_banner_until_remount() {
    let mut h = harness();
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;
    h.controller.add_task("still here").await.unwrap();
    settle(&mut h.view, |v| v.tasks.len() == 1).await;

    h.store
        .break_subscriptions(&me, &StoreError::Unavailable("backend restarted".to_string()));
    let view = settle(&mut h.view, |v| v.state.is_error()).await;
    assert_eq!(
        view.state,
        SyncState::Error("Failed to load tasks: store unavailable: backend restarted".to_string())
    );

    // No automatic retry.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.controller.snapshot().state.is_error());
    assert_eq!(h.store.live_queries(), 0);

    h.controller.remount();
    let view = live_for(&mut h, &me).await;
    assert_eq!(texts(&view), ["still here"]);
}

// ---------------------------------------------------------------------------
// Pending timestamps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_tasks_sort_first_then_settle() {
    let mut h = harness_with(MemoryTaskStore::with_deferred_timestamps());
    let me = h.session.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut h, &me).await;

    h.controller.add_task("older").await.unwrap();
    h.controller.add_task("newer").await.unwrap();
    let view = settle(&mut h.view, |v| v.tasks.len() == 2).await;
    assert!(view.tasks.iter().all(|t| t.created_at.is_none()));
    assert_eq!(texts(&view), ["newer", "older"]);

    h.store.commit_timestamps();
    let view = settle(&mut h.view, |v| v.tasks.iter().all(|t| t.created_at.is_some())).await;
    assert_eq!(texts(&view), ["newer", "older"]);
}
