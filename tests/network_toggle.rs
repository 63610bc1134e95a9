mod common;

use common::*;
use firestore_sync::firestore::core::{ListenOptions, Query};
use firestore_sync::firestore::remote::watch_change::{DocumentChange, ListenRequest, WatchChange};
use firestore_sync::firestore::remote::{MultiplexedStream, OnlineState};

async fn serve_documents(stream: &MultiplexedStream, paths: &[&str], token: u8, version: i64) -> i32 {
    let target_id = match next_listen_request(stream).await {
        ListenRequest::AddTarget(target) => target.target_id,
        other => panic!("unexpected request {other:?}"),
    };
    ack_targets(stream, vec![target_id]).await;
    for path in paths {
        send(
            stream,
            WatchChange::DocumentChange(DocumentChange {
                target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: document(path, version, 1),
            }),
        )
        .await;
    }
    mark_current(stream, vec![target_id], token, version).await;
    target_id
}

#[tokio::test]
async fn going_offline_and_back_resumes_from_the_last_token() {
    let harness = start().await;
    let (callback, snapshots) = sink();
    let _registration = harness
        .client
        .listen(
            Query::collection("rooms").unwrap(),
            ListenOptions::default().with_metadata_changes(),
            callback,
        )
        .await
        .unwrap();

    let stream = harness.backend.accept("listen").await;
    let target_id = serve_documents(&stream, &["rooms/a", "rooms/b"], 7, 5).await;
    let online = loop {
        let snapshot = snapshots.next().await;
        if !snapshot.from_cache {
            break snapshot;
        }
    };
    assert_eq!(online.documents.len(), 2);
    assert_eq!(harness.client.online_state(), OnlineState::Online);

    harness.client.disable_network().await.unwrap();
    let offline = snapshots.next().await;
    assert!(offline.from_cache);
    assert!(offline.changes.is_empty());
    assert_eq!(harness.client.online_state(), OnlineState::Offline);

    harness.client.enable_network().await.unwrap();
    let resumed = harness.backend.accept("listen").await;
    match next_listen_request(&resumed).await {
        ListenRequest::AddTarget(target) => {
            assert_eq!(target.target_id, target_id);
            assert_eq!(target.resume_token, vec![7]);
            assert_eq!(target.expected_count, Some(2));
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn server_read_waits_for_a_consistent_snapshot() {
    let harness = start().await;
    let read = harness
        .client
        .get_documents_from_server(Query::collection("rooms").unwrap());
    let serve = async {
        let stream = harness.backend.accept("listen").await;
        serve_documents(&stream, &["rooms/a"], 1, 1).await;
        stream
    };
    let (snapshot, _stream) = tokio::join!(read, serve);
    let snapshot = snapshot.unwrap();
    assert_eq!(keys_of(&snapshot), vec!["rooms/a".to_string()]);
    assert!(!snapshot.from_cache);
}

#[tokio::test]
async fn terminated_client_rejects_new_work() {
    let harness = start().await;
    harness.client.terminate().await.unwrap();
    let err = match harness.client.write(vec![set("rooms/a", 1)]).await {
        Ok(_) => panic!("write accepted after terminate"),
        Err(err) => err,
    };
    assert_eq!(err.code, firestore_sync::firestore::FirestoreErrorCode::Cancelled);
}
