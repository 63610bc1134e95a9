#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_sync::firestore::core::{FirestoreClient, FirestoreSettings, ViewSnapshot};
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, FieldPath, Mutation, Timestamp, User};
use firestore_sync::firestore::remote::datastore::StreamingDatastoreImpl;
use firestore_sync::firestore::remote::streams::{WriteRequest, WriteResponse};
use firestore_sync::firestore::remote::watch_change::{
    ListenRequest, TargetChangeState, WatchChange, WatchDocument, WatchTargetChange,
};
use firestore_sync::firestore::remote::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, NetworkLayer, StaticTokenProvider,
    TokenProviderArc,
};
use firestore_sync::firestore::value::{FirestoreValue, ObjectValue};
use firestore_sync::firestore::FirestoreResult;

pub const PROJECT: &str = "p";
const WAIT: Duration = Duration::from_secs(5);

pub fn database_id() -> DatabaseId {
    DatabaseId::default(PROJECT)
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn fields(value: i64) -> ObjectValue {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(value));
    data
}

pub fn set(path: &str, value: i64) -> Mutation {
    Mutation::set(key(path), fields(value))
}

pub fn document(path: &str, version: i64, value: i64) -> WatchDocument {
    WatchDocument {
        key: key(path),
        fields: fields(value),
        update_time: Timestamp::new(version, 0),
        create_time: Some(Timestamp::new(1, 0)),
    }
}

/// Scripted server end of the in-memory transport.
pub struct Backend {
    connection: MultiplexedConnection,
    stashed: Mutex<Vec<MultiplexedStream>>,
}

impl Backend {
    /// Waits for the client to open a stream for `method`, holding on to
    /// streams for other methods that arrive first.
    pub async fn accept(&self, method: &str) -> MultiplexedStream {
        {
            let mut stashed = self.stashed.lock().unwrap();
            if let Some(index) = stashed.iter().position(|stream| stream.metadata().method == method) {
                return stashed.remove(index);
            }
        }
        loop {
            let stream = tokio::time::timeout(WAIT, self.connection.accept_stream())
                .await
                .expect("timed out waiting for a stream")
                .expect("stream");
            if stream.metadata().method == method {
                return stream;
            }
            self.stashed.lock().unwrap().push(stream);
        }
    }
}

pub struct Harness {
    pub client: FirestoreClient,
    pub backend: Backend,
    pub provider: Arc<StaticTokenProvider>,
}

pub async fn start() -> Harness {
    start_with(FirestoreSettings::new(database_id())).await
}

pub async fn start_with(settings: FirestoreSettings) -> Harness {
    let (left, right) = InMemoryTransport::pair();
    let provider = Arc::new(StaticTokenProvider::new(User::unauthenticated(), None));
    let auth: TokenProviderArc = provider.clone();
    let network = NetworkLayer::builder(
        Arc::new(StreamingDatastoreImpl::new(Arc::new(MultiplexedConnection::new(left)))),
        auth,
    )
    .build();
    let client = FirestoreClient::new(settings, network).await.unwrap();
    Harness {
        client,
        backend: Backend {
            connection: MultiplexedConnection::new(right),
            stashed: Mutex::new(Vec::new()),
        },
        provider,
    }
}

async fn next_frame<T: serde::de::DeserializeOwned>(stream: &MultiplexedStream) -> T {
    let payload = tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream closed")
        .expect("frame");
    serde_json::from_slice(&payload).expect("decode frame")
}

pub async fn next_listen_request(stream: &MultiplexedStream) -> ListenRequest {
    next_frame(stream).await
}

/// Asserts the client sends nothing on `stream` for a short while.
pub async fn expect_quiet(stream: &MultiplexedStream) {
    let result = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(result.is_err(), "unexpected frame from the client");
}

pub async fn send(stream: &MultiplexedStream, change: WatchChange) {
    stream.send(change.encode().unwrap()).await.unwrap();
}

pub async fn ack_targets(stream: &MultiplexedStream, target_ids: Vec<i32>) {
    send(
        stream,
        WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, target_ids)),
    )
    .await;
}

/// Marks `target_ids` current and closes the pass at `version`.
pub async fn mark_current(stream: &MultiplexedStream, target_ids: Vec<i32>, token: u8, version: i64) {
    send(
        stream,
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, target_ids).with_resume_token(vec![token]),
        ),
    )
    .await;
    global_snapshot(stream, version).await;
}

pub async fn global_snapshot(stream: &MultiplexedStream, version: i64) {
    send(
        stream,
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new())
                .with_read_time(Timestamp::new(version, 0)),
        ),
    )
    .await;
}

/// Answers the write stream handshake.
pub async fn handshake(stream: &MultiplexedStream) {
    let request: WriteRequest = next_frame(stream).await;
    assert!(matches!(request, WriteRequest::Handshake { .. }));
    let response = WriteResponse {
        stream_token: vec![1],
        ..WriteResponse::default()
    };
    stream.send(serde_json::to_vec(&response).unwrap()).await.unwrap();
}

pub async fn next_write_request(stream: &MultiplexedStream) -> WriteRequest {
    next_frame(stream).await
}

pub async fn send_write_response(stream: &MultiplexedStream, response: &WriteResponse) {
    stream.send(serde_json::to_vec(response).unwrap()).await.unwrap();
}

/// Collects listener callbacks so tests can await them in order.
pub struct Snapshots {
    receiver: async_channel::Receiver<FirestoreResult<ViewSnapshot>>,
}

pub fn sink() -> (
    impl Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    Snapshots,
) {
    let (sender, receiver) = async_channel::unbounded();
    let callback = move |result| {
        let _ = sender.try_send(result);
    };
    (callback, Snapshots { receiver })
}

impl Snapshots {
    pub async fn next_result(&self) -> FirestoreResult<ViewSnapshot> {
        tokio::time::timeout(WAIT, self.receiver.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("listener dropped")
    }

    pub async fn next(&self) -> ViewSnapshot {
        self.next_result().await.expect("listen error")
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

pub fn keys_of(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot
        .documents
        .iter()
        .map(|document| document.key().path().canonical_string())
        .collect()
}
