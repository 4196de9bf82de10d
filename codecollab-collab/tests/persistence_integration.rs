//! Persistence integration tests.
//!
//! Verify that file contents, memberships and chat history survive a store
//! restart, and that edits applied through a running server land on disk.

use codecollab_collab::client::{SyncClient, SyncEvent};
use codecollab_collab::server::{CollabServer, ServerConfig};
use codecollab_collab::storage::{Persistence, RocksStore, StoreConfig, StoreError};
use codecollab_collab::JwtVerifier;
use codecollab_core::{EditEvent, ProjectId, User};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};

fn open_store(path: &Path) -> RocksStore {
    RocksStore::open(StoreConfig::for_testing(path)).unwrap()
}

#[test]
fn test_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let alice = User::new("alice");
    let bob = User::new("bob");

    let (project_id, file_id, extra_id) = {
        let store = open_store(&path);
        store.put_user(&alice).unwrap();
        store.put_user(&bob).unwrap();
        let detail = store.create_project(alice.id, "persisted").unwrap();
        let project_id = detail.project.id;
        let file_id = detail.files[0].id;
        store.add_member(project_id, bob.id).unwrap();
        let extra = store.create_file(project_id, "style.css").unwrap();

        store.overwrite_content(project_id, file_id, "let x = 1;").unwrap();
        store.append_message(project_id, bob.id, "saved?").unwrap();
        (project_id, file_id, extra.id)
        // Store dropped here, closing RocksDB
    };

    let store = open_store(&path);
    let detail = store.project_detail(project_id).unwrap();
    assert_eq!(detail.project.name, "persisted");
    assert_eq!(detail.members.len(), 2);
    assert_eq!(detail.members[0].id, alice.id);

    let ids: Vec<_> = detail.files.iter().map(|f| f.id).collect();
    assert_eq!(ids, vec![file_id, extra_id]);
    assert_eq!(store.file(file_id).unwrap().content, "let x = 1;");
    assert_eq!(store.file(extra_id).unwrap().language, "css");

    assert!(store.is_member(project_id, bob.id).unwrap());
    let history = store.messages(project_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "saved?");
}

#[test]
fn test_ids_keep_increasing_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let alice = User::new("alice");

    let first = {
        let store = open_store(&path);
        store.put_user(&alice).unwrap();
        store.create_project(alice.id, "one").unwrap()
    };

    let store = open_store(&path);
    let second = store.create_project(alice.id, "two").unwrap();
    assert!(second.project.id > first.project.id);
    assert!(second.files[0].id > first.files[0].id);

    let owned = store.projects_owned_by(alice.id).unwrap();
    assert_eq!(owned.len(), 2);
    assert_eq!(owned[0].id, second.project.id);
}

#[test]
fn test_last_writer_wins_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let alice = User::new("alice");
    store.put_user(&alice).unwrap();
    let detail = store.create_project(alice.id, "lww").unwrap();
    let (project_id, file_id) = (detail.project.id, detail.files[0].id);

    for content in ["a", "ab", "", "final"] {
        store.overwrite_content(project_id, file_id, content).unwrap();
        assert_eq!(store.file(file_id).unwrap().content, content);
    }
}

#[test]
fn test_cascade_delete_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let alice = User::new("alice");
    let bob = User::new("bob");

    let (doomed, survivor, doomed_file, survivor_file) = {
        let store = open_store(&path);
        store.put_user(&alice).unwrap();
        store.put_user(&bob).unwrap();
        let doomed = store.create_project(alice.id, "doomed").unwrap();
        let survivor = store.create_project(alice.id, "survivor").unwrap();
        store.add_member(doomed.project.id, bob.id).unwrap();
        store.append_message(doomed.project.id, alice.id, "bye").unwrap();
        store.append_message(survivor.project.id, alice.id, "hi").unwrap();

        store.delete_project(doomed.project.id).unwrap();
        (
            doomed.project.id,
            survivor.project.id,
            doomed.files[0].id,
            survivor.files[0].id,
        )
    };

    let store = open_store(&path);
    assert!(matches!(
        store.project(doomed),
        Err(StoreError::ProjectNotFound(id)) if id == doomed
    ));
    assert!(matches!(
        store.file(doomed_file),
        Err(StoreError::FileNotFound(_))
    ));
    assert!(store.messages(doomed).unwrap().is_empty());
    assert!(!store.is_member(doomed, bob.id).unwrap());
    assert!(matches!(
        store.overwrite_content(doomed, doomed_file, "ghost"),
        Err(StoreError::FileNotFound(_))
    ));

    // Neighbouring project untouched
    assert_eq!(store.files(survivor).unwrap()[0].id, survivor_file);
    assert_eq!(store.messages(survivor).unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_edit_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let alice = User::new("alice");

    let (project_id, file_id) = {
        let store = open_store(&path);
        store.put_user(&alice).unwrap();
        let detail = store.create_project(alice.id, "live").unwrap();
        (detail.project.id, detail.files[0].id)
    };

    {
        let server = Arc::new(
            CollabServer::open(ServerConfig {
                storage_path: path.clone(),
                jwt_secret: "restart-secret".to_string(),
                ..ServerConfig::default()
            })
            .unwrap(),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = server.clone();
        let handle = tokio::spawn(async move {
            serving
                .serve_with_shutdown(listener, async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut client = SyncClient::new(url);
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        let token = JwtVerifier::new("restart-secret").issue(alice.id).unwrap();
        client.join_project(project_id, Some(token)).await.unwrap();
        wait_for_join(&mut events, project_id).await;

        client
            .send_code_change(EditEvent::new(project_id, file_id, "survives"))
            .await
            .unwrap();

        // Sole member: wait until the server has applied the edit
        for _ in 0..100 {
            if server.stats().await.sync.edits_applied == 1 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.stats().await.sync.edits_applied, 1);

        // Client still connected: shutdown has to close it
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(server.stats().await.active_connections, 0);
    }

    let store = open_store(&path);
    assert_eq!(store.file(file_id).unwrap().content, "survives");
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let alice = User::new("alice");

    let (project_id, file_id) = {
        let store = open_store(&path);
        store.put_user(&alice).unwrap();
        let detail = store.create_project(alice.id, "closing").unwrap();
        store
            .overwrite_content(detail.project.id, detail.files[0].id, "before")
            .unwrap();
        (detail.project.id, detail.files[0].id)
    };

    let server = Arc::new(
        CollabServer::open(ServerConfig {
            storage_path: path.clone(),
            jwt_secret: "closing-secret".to_string(),
            ..ServerConfig::default()
        })
        .unwrap(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        serving
            .serve_with_shutdown(listener, async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let mut client = SyncClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let token = JwtVerifier::new("closing-secret").issue(alice.id).unwrap();
    client.join_project(project_id, Some(token)).await.unwrap();
    wait_for_join(&mut events, project_id).await;

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("shutdown waited on an open connection")
        .unwrap()
        .unwrap();

    // The server sent a Close frame
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(SyncEvent::Disconnected) => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }

    let _ = client
        .send_code_change(EditEvent::new(project_id, file_id, "after shutdown"))
        .await;
    sleep(Duration::from_millis(100)).await;

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.sync.edits_applied, 0);

    // No connection task still holds the store open
    drop(server);
    let store = open_store(&path);
    assert_eq!(store.file(file_id).unwrap().content, "before");
}

async fn wait_for_join(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>, project_id: ProjectId) {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for join")
            .expect("event channel closed");
        match event {
            SyncEvent::Connected => continue,
            SyncEvent::Joined(id) => {
                assert_eq!(id, project_id);
                return;
            }
            other => panic!("expected Joined, got {other:?}"),
        }
    }
}
