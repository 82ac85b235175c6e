//! End-to-end tests: sync controller over [`RemoteBackend`] against an
//! in-process `tasklist-server`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use tasklist::remote::RemoteBackend;
use tasklist::session::SessionProvider;
use tasklist::sync::{SyncState, SyncView, TaskSyncController};
use tasklist_proto::task::Identity;
use tasklist_server::server::{ServerState, start_server_with_state};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Starts a server on an ephemeral port and returns its state and URL.
async fn spawn_server() -> (Arc<ServerState>, String) {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (state, format!("ws://{addr}/ws"))
}

struct Client {
    backend: Arc<RemoteBackend>,
    controller: Arc<TaskSyncController<RemoteBackend>>,
    view: watch::Receiver<SyncView>,
    _follower: tokio::task::JoinHandle<()>,
}

async fn client(url: &str) -> Client {
    let backend = Arc::new(
        RemoteBackend::connect(url, Duration::from_secs(2), Duration::from_secs(2))
            .await
            .expect("failed to connect"),
    );
    let controller = Arc::new(TaskSyncController::new(Arc::clone(&backend)));
    let follower = controller.follow(backend.as_ref());
    let view = controller.view();
    Client {
        backend,
        controller,
        view,
        _follower: follower,
    }
}

async fn settle(rx: &mut watch::Receiver<SyncView>, pred: impl FnMut(&SyncView) -> bool) -> SyncView {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for view")
        .expect("controller dropped")
        .clone()
}

async fn live_for(c: &mut Client, identity: &Identity) -> SyncView {
    let identity = identity.clone();
    settle(&mut c.view, move |v| {
        v.state == SyncState::Live && v.identity.as_ref() == Some(&identity)
    })
    .await
}

/// Polls until the server holds `expected` live queries.
async fn wait_for_live_queries(state: &ServerState, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.documents.live_queries().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never reached expected live query count");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_toggle_delete_through_server() {
    let (_state, url) = spawn_server().await;
    let mut c = client(&url).await;

    let me = c
        .backend
        .sign_up_password("u1@example.com", "secret1")
        .await
        .unwrap();
    assert!(live_for(&mut c, &me).await.tasks.is_empty());

    let id = c.controller.add_task("Buy milk").await.unwrap();
    let view = settle(&mut c.view, |v| v.tasks.len() == 1).await;
    assert_eq!(view.tasks[0].id, id);
    assert_eq!(view.tasks[0].text, "Buy milk");
    assert!(view.tasks[0].created_at.is_some());

    c.controller.toggle_task(&id).await.unwrap();
    settle(&mut c.view, |v| v.tasks.first().is_some_and(|t| t.completed)).await;

    c.controller.delete_task(&id).await.unwrap();
    settle(&mut c.view, |v| v.tasks.is_empty()).await;
}

#[tokio::test]
async fn server_orders_newest_first() {
    let (_state, url) = spawn_server().await;
    let mut c = client(&url).await;
    let me = c.backend.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut c, &me).await;

    for text in ["t1", "t2", "t3"] {
        c.controller.add_task(text).await.unwrap();
    }
    let view = settle(&mut c.view, |v| v.tasks.len() == 3).await;
    let texts: Vec<&str> = view.tasks.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, ["t3", "t2", "t1"]);
}

#[tokio::test]
async fn second_device_sees_writes_live() {
    let (_state, url) = spawn_server().await;
    let mut phone = client(&url).await;
    let mut laptop = client(&url).await;

    let me = phone
        .backend
        .sign_up_password("u@example.com", "secret1")
        .await
        .unwrap();
    let same = laptop
        .backend
        .sign_in_password("u@example.com", "secret1")
        .await
        .unwrap();
    assert_eq!(me, same);
    live_for(&mut phone, &me).await;
    live_for(&mut laptop, &me).await;

    let id = phone.controller.add_task("from phone").await.unwrap();
    let view = settle(&mut laptop.view, |v| v.tasks.len() == 1).await;
    assert_eq!(view.tasks[0].id, id);

    laptop.controller.toggle_task(&id).await.unwrap();
    settle(&mut phone.view, |v| v.tasks.first().is_some_and(|t| t.completed)).await;
}

#[tokio::test]
async fn users_are_isolated_on_one_server() {
    let (_state, url) = spawn_server().await;
    let mut ann = client(&url).await;
    let mut bob = client(&url).await;

    let ann_id = ann.backend.sign_up_password("ann@example.com", "secret1").await.unwrap();
    let bob_id = bob.backend.sign_up_password("bob@example.com", "secret1").await.unwrap();
    live_for(&mut ann, &ann_id).await;
    live_for(&mut bob, &bob_id).await;

    ann.controller.add_task("ann's").await.unwrap();
    settle(&mut ann.view, |v| v.tasks.len() == 1).await;
    bob.controller.add_task("bob's").await.unwrap();
    let bob_view = settle(&mut bob.view, |v| v.tasks.len() == 1).await;

    assert_eq!(bob_view.tasks[0].text, "bob's");
    assert!(bob_view.tasks.iter().all(|t| t.owner == bob_id));
    let ann_view = ann.controller.snapshot();
    assert_eq!(ann_view.tasks.len(), 1);
    assert!(ann_view.tasks.iter().all(|t| t.owner == ann_id));
}

#[tokio::test]
async fn sign_out_releases_server_query() {
    let (state, url) = spawn_server().await;
    let mut c = client(&url).await;
    let me = c.backend.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut c, &me).await;
    wait_for_live_queries(&state, 1).await;

    c.backend.sign_out().await.unwrap();
    let view = settle(&mut c.view, |v| v.state == SyncState::Unsubscribed).await;
    assert!(view.tasks.is_empty());
    assert!(c.backend.current_identity().is_none());
    wait_for_live_queries(&state, 0).await;
}

#[tokio::test]
async fn lost_connection_shows_banner() {
    let (state, url) = spawn_server().await;
    let mut c = client(&url).await;
    let me = c.backend.sign_up_password("u@example.com", "secret1").await.unwrap();
    live_for(&mut c, &me).await;
    c.controller.add_task("before the outage").await.unwrap();
    settle(&mut c.view, |v| v.tasks.len() == 1).await;

    state.close_all_connections().await;
    let view = settle(&mut c.view, |v| v.state.is_error()).await;
    assert_eq!(
        view.state,
        SyncState::Error("Failed to load tasks: connection closed".to_string())
    );
    assert_eq!(view.identity, Some(me));

    let err = c.controller.add_task("during the outage").await.unwrap_err();
    assert!(err.user_message().starts_with("Failed to add task"));
}
