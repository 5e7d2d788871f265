//! Presence integration tests.
//!
//! Verifies:
//! - Sessions on one document list each other (never themselves)
//! - Blur removes the local record; Focus brings it back
//! - A collaborator that vanishes without cleanup ages out
//! - Cursor moves reach other sessions
//! - Presence failures never block saving
//!
//! Runs on real time with the millisecond-scale test timings.

use std::sync::Arc;

use quire_collab::{
    CollaboratorInfo, CursorPosition, DocumentSession, LifecycleEvent, LifecycleSource, LocalOp,
    MemoryStore, PresenceTracker, RemoteStore, SaveState, SessionConfig, UserIdentity,
};
use tokio::sync::watch;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn open(store: &MemoryStore, doc_id: Uuid, name: &str) -> DocumentSession {
    DocumentSession::builder(
        doc_id,
        UserIdentity::new(Uuid::new_v4(), name),
        Arc::new(store.clone()),
    )
    .config(SessionConfig::for_testing())
    .open()
    .await
    .unwrap()
}

async fn wait_list<F>(rx: &mut watch::Receiver<Vec<CollaboratorInfo>>, what: &str, pred: F)
where
    F: FnMut(&Vec<CollaboratorInfo>) -> bool,
{
    let result = timeout(Duration::from_secs(3), rx.wait_for(pred)).await;
    assert!(
        matches!(result, Ok(Ok(_))),
        "timed out waiting for {what}"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sessions_list_each_other() {
    let store = MemoryStore::new();
    let doc_id = Uuid::new_v4();
    let alice = open(&store, doc_id, "Alice").await;
    let bob = open(&store, doc_id, "Bob").await;
    let carol = open(&store, doc_id, "Carol").await;

    let mut list = alice.collaborators();
    wait_list(&mut list, "Bob and Carol", |l| l.len() == 2).await;

    let names: Vec<String> = list.borrow().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["Bob".to_string(), "Carol".to_string()]);
    assert!(list.borrow().iter().all(|c| c.user_id != alice.user().user_id));

    let bob_entry = list.borrow().iter().find(|c| c.name == "Bob").cloned().unwrap();
    assert_eq!(bob_entry.color, bob.user().color().to_hex());
    assert!(bob_entry.color.starts_with('#') && bob_entry.color.len() == 7);

    alice.close().await;
    bob.close().await;
    carol.close().await;
}

#[tokio::test]
async fn test_blur_leaves_and_focus_returns() {
    let store = MemoryStore::new();
    let doc_id = Uuid::new_v4();
    let alice = open(&store, doc_id, "Alice").await;
    let bob = open(&store, doc_id, "Bob").await;

    let mut list = alice.collaborators();
    wait_list(&mut list, "Bob to appear", |l| l.len() == 1).await;

    bob.lifecycle().emit(LifecycleEvent::Blur);
    wait_list(&mut list, "Bob to leave", |l| l.is_empty()).await;
    assert_eq!(store.list_presence(doc_id).await.unwrap().len(), 1);

    bob.lifecycle().emit(LifecycleEvent::Focus);
    wait_list(&mut list, "Bob to return", |l| l.len() == 1).await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_close_removes_record() {
    let store = MemoryStore::new();
    let doc_id = Uuid::new_v4();
    let alice = open(&store, doc_id, "Alice").await;
    let bob = open(&store, doc_id, "Bob").await;

    let mut list = alice.collaborators();
    wait_list(&mut list, "Bob to appear", |l| l.len() == 1).await;

    bob.close().await;
    wait_list(&mut list, "Bob to leave", |l| l.is_empty()).await;

    alice.close().await;
    assert!(store.list_presence(doc_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_vanished_collaborator_goes_stale() {
    let store = MemoryStore::new();
    let doc_id = Uuid::new_v4();
    let config = SessionConfig::for_testing();
    let alice = open(&store, doc_id, "Alice").await;

    // A tracker that dies without removing its record
    let lifecycle = LifecycleSource::new();
    let ghost = PresenceTracker::spawn(
        doc_id,
        UserIdentity::new(Uuid::new_v4(), "Ghost"),
        Arc::new(store.clone()),
        config.presence.clone(),
        lifecycle.subscribe(),
    )
    .await
    .unwrap();

    let mut list = alice.collaborators();
    wait_list(&mut list, "Ghost to appear", |l| l.len() == 1).await;

    drop(ghost);
    wait_list(&mut list, "Ghost to age out", |l| l.is_empty()).await;
    // The record itself is still there; only its age hides it
    assert_eq!(store.list_presence(doc_id).await.unwrap().len(), 2);

    alice.close().await;
}

#[tokio::test]
async fn test_cursor_moves_propagate() {
    let store = MemoryStore::new();
    let doc_id = Uuid::new_v4();
    let alice = open(&store, doc_id, "Alice").await;
    let bob = open(&store, doc_id, "Bob").await;

    let mut list = alice.collaborators();
    wait_list(&mut list, "Bob to appear", |l| l.len() == 1).await;

    let selection = CursorPosition { anchor: 2, head: 7 };
    bob.set_cursor(Some(selection));
    wait_list(&mut list, "Bob's cursor", |l| {
        l.first().and_then(|c| c.cursor) == Some(selection)
    })
    .await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_presence_failures_do_not_block_saving() {
    let store = MemoryStore::new();
    let doc_id = Uuid::new_v4();
    store.set_fail_presence(true);

    let alice = open(&store, doc_id, "Alice").await;
    alice.on_local_edit(LocalOp::insert(0, "still saved")).await;

    let mut status = alice.save_status();
    let saved = timeout(
        Duration::from_secs(3),
        status.wait_for(|s| s.state == SaveState::Saved && s.last_saved.is_some()),
    )
    .await;
    assert!(matches!(saved, Ok(Ok(_))));
    drop(saved);

    assert!(store.list_presence(doc_id).await.unwrap().is_empty());
    alice.close().await;
}
