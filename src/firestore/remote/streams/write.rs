use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion, Timestamp};
use crate::firestore::remote::datastore::{mutation_results, WireWriteResult};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::stream::{PersistentStream, StreamEventHandler, StreamKind};

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_write_open(&self);

    /// The first server response arrived; mutations may be sent now.
    async fn on_handshake_complete(&self);

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<FirestoreResult<MutationResult>>,
    );

    async fn on_write_close(&self, error: Option<FirestoreError>);
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {}

/// Client to server write frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteRequest {
    Handshake {
        handshake: HandshakeRequest,
    },
    #[serde(rename_all = "camelCase")]
    Mutations {
        #[serde(with = "crate::util::base64")]
        stream_token: Vec<u8>,
        writes: Vec<Mutation>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    #[serde(default, with = "crate::util::base64")]
    pub stream_token: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<Timestamp>,
    #[serde(default)]
    pub write_results: Vec<WireWriteResult>,
}

impl WriteResponse {
    pub fn commit_version(&self) -> SnapshotVersion {
        self.commit_time
            .map(SnapshotVersion::from_timestamp)
            .unwrap_or_else(SnapshotVersion::min)
    }
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

struct WriteStreamHandler {
    delegate: Arc<dyn WriteStreamDelegate>,
    state: Arc<Mutex<WriteStreamState>>,
}

fn lock(state: &Mutex<WriteStreamState>) -> MutexGuard<'_, WriteStreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl StreamEventHandler for WriteStreamHandler {
    async fn on_open(&self) {
        self.delegate.on_write_open().await;
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response: WriteResponse = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("failed to decode write response: {err}")))?;
        let first = {
            let mut state = lock(&self.state);
            state.last_stream_token = response.stream_token.clone();
            !std::mem::replace(&mut state.handshake_complete, true)
        };
        if first {
            self.delegate.on_handshake_complete().await;
        } else {
            let commit_version = response.commit_version();
            let results = mutation_results(&response.write_results, commit_version);
            self.delegate.on_write_response(commit_version, results).await;
        }
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        self.delegate.on_write_close(error).await;
    }
}

/// The write stream. Every connection starts with a handshake whose reply
/// carries the stream token; mutation batches follow, each acknowledged by
/// one response in send order.
#[derive(Clone)]
pub struct WriteStream {
    stream: PersistentStream<WriteStreamHandler>,
    state: Arc<Mutex<WriteStreamState>>,
}

impl WriteStream {
    pub fn new(queue: AsyncQueue, network: NetworkLayer, delegate: Arc<dyn WriteStreamDelegate>) -> Self {
        let state = Arc::new(Mutex::new(WriteStreamState::default()));
        let handler = Arc::new(WriteStreamHandler {
            delegate,
            state: Arc::clone(&state),
        });
        Self {
            stream: PersistentStream::new(StreamKind::Write, queue, network, handler),
            state,
        }
    }

    /// Starts a new connection. The handshake and the stream token belong to
    /// one connection, so both are reset.
    pub fn start(&self) {
        {
            let mut state = lock(&self.state);
            state.handshake_complete = false;
            state.last_stream_token.clear();
        }
        self.stream.start();
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.state).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock(&self.state).last_stream_token = token;
    }

    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        self.send(&WriteRequest::Handshake {
            handshake: HandshakeRequest {},
        })
        .await
    }

    pub async fn write_mutations(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let request = WriteRequest::Mutations {
            stream_token: self.last_stream_token(),
            writes: mutations,
        };
        self.send(&request).await
    }

    async fn send(&self, request: &WriteRequest) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("failed to encode write request: {err}")))?;
        self.stream.send(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, User};
    use crate::firestore::remote::credentials::{StaticTokenProvider, TokenProviderArc};
    use crate::firestore::remote::datastore::StreamingDatastoreImpl;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Handshake,
        Response(SnapshotVersion, usize),
    }

    struct Recorder {
        events: async_channel::Sender<Event>,
    }

    #[async_trait]
    impl WriteStreamDelegate for Recorder {
        async fn on_write_open(&self) {
            let _ = self.events.send(Event::Open).await;
        }

        async fn on_handshake_complete(&self) {
            let _ = self.events.send(Event::Handshake).await;
        }

        async fn on_write_response(
            &self,
            commit_version: SnapshotVersion,
            results: Vec<FirestoreResult<MutationResult>>,
        ) {
            let _ = self
                .events
                .send(Event::Response(commit_version, results.len()))
                .await;
        }

        async fn on_write_close(&self, _error: Option<FirestoreError>) {}
    }

    #[test]
    fn requests_encode_as_expected() {
        let handshake = serde_json::to_value(WriteRequest::Handshake {
            handshake: HandshakeRequest {},
        })
        .unwrap();
        assert_eq!(handshake, serde_json::json!({ "handshake": {} }));

        let key = DocumentKey::from_string("rooms/a").unwrap();
        let request = WriteRequest::Mutations {
            stream_token: vec![1, 2],
            writes: vec![Mutation::delete(key)],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["streamToken"], serde_json::json!("AQI="));
        let decoded: WriteRequest = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn handshake_then_acknowledged_writes() {
        let (left, right) = InMemoryTransport::pair();
        let server = MultiplexedConnection::new(right);
        let auth: TokenProviderArc = Arc::new(StaticTokenProvider::new(User::unauthenticated(), None));
        let network = NetworkLayer::builder(
            Arc::new(StreamingDatastoreImpl::new(Arc::new(MultiplexedConnection::new(left)))),
            auth,
        )
        .build();
        let queue = AsyncQueue::new();
        let (events_tx, events) = async_channel::unbounded();
        let stream = WriteStream::new(queue.clone(), network, Arc::new(Recorder { events: events_tx }));

        let starter = stream.clone();
        queue.enqueue(async move { starter.start() }).unwrap();
        let peer = server.accept_stream().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        let writer = stream.clone();
        queue
            .enqueue_and_wait(async move { writer.write_handshake().await })
            .await
            .unwrap();
        let request: WriteRequest = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(request, WriteRequest::Handshake { .. }));

        let handshake = WriteResponse {
            stream_token: vec![9],
            ..WriteResponse::default()
        };
        peer.send(serde_json::to_vec(&handshake).unwrap()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Handshake);
        assert!(stream.handshake_complete());
        assert_eq!(stream.last_stream_token(), vec![9]);

        let writer = stream.clone();
        queue
            .enqueue_and_wait(async move {
                let key = DocumentKey::from_string("rooms/a").unwrap();
                writer.write_mutations(vec![Mutation::delete(key)]).await
            })
            .await
            .unwrap();
        let request: WriteRequest = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        match request {
            WriteRequest::Mutations { stream_token, writes } => {
                assert_eq!(stream_token, vec![9]);
                assert_eq!(writes.len(), 1);
            }
            other => panic!("unexpected request {other:?}"),
        }

        let ack = WriteResponse {
            stream_token: vec![10],
            commit_time: Some(Timestamp::new(6, 0)),
            write_results: vec![WireWriteResult::default()],
        };
        peer.send(serde_json::to_vec(&ack).unwrap()).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Response(SnapshotVersion::from_timestamp(Timestamp::new(6, 0)), 1)
        );
        assert_eq!(stream.last_stream_token(), vec![10]);
    }
}
