//! Frame-level multiplexing of logical streams over one transport.
//!
//! The client opens a logical stream per listen stream, write stream and
//! unary call. The peer side of an [`InMemoryTransport`] pair accepts
//! those streams with [`MultiplexedConnection::accept_stream`], which is
//! how tests script a backend.

pub mod persistent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub use persistent::{PersistentStream, StreamEventHandler, StreamKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Headers sent with the frame that opens a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    /// `listen`, `write`, `commit` or `batchGet`.
    pub method: String,
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

impl StreamMetadata {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamMetadata),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, metadata: StreamMetadata) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(metadata),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn lock_streams(streams: &StreamTable) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
    accepted: Receiver<MultiplexedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accept_tx, accept_rx) = async_channel::unbounded();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

        start_outbound_loop(Arc::clone(&transport), outbound_rx);
        start_inbound_loop(
            transport,
            Arc::clone(&streams),
            outbound_tx.clone(),
            accept_tx,
        );

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted: accept_rx,
        }
    }

    pub async fn open_stream(&self, metadata: StreamMetadata) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock_streams(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, metadata.clone()))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            metadata,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            streams: Arc::clone(&self.streams),
        })
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> FirestoreResult<MultiplexedStream> {
        self.accepted
            .recv()
            .await
            .map_err(|_| unavailable("connection closed"))
    }
}

fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
    runtime::spawn_detached(async move {
        while let Ok(frame) = outbound_rx.recv().await {
            if let Err(err) = transport.send(frame).await {
                log::warn!("multiplexed outbound loop terminated: {err:?}");
                break;
            }
        }
    });
}

fn start_inbound_loop(
    transport: Arc<dyn StreamTransport>,
    streams: StreamTable,
    outbound_tx: Sender<TransportFrame>,
    accept_tx: Sender<MultiplexedStream>,
) {
    runtime::spawn_detached(async move {
        loop {
            let frame = match transport.next().await {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("multiplexed inbound loop terminated: {err:?}");
                    break;
                }
            };
            let stream_id = frame.stream_id();
            let event = frame.kind().clone();

            if let FrameKind::Open(metadata) = event {
                let (inbound_tx, inbound_rx) = async_channel::unbounded();
                lock_streams(&streams).insert(stream_id, inbound_tx);
                let stream = MultiplexedStream {
                    id: stream_id,
                    metadata,
                    outbound: outbound_tx.clone(),
                    inbound: inbound_rx,
                    streams: Arc::clone(&streams),
                };
                if accept_tx.send(stream).await.is_err() {
                    log::debug!("no acceptor for stream {}", stream_id.value());
                }
                continue;
            }

            let sender = lock_streams(&streams).get(&stream_id).cloned();
            let Some(sender) = sender else {
                log::debug!("dropping frame for unknown stream {}", stream_id.value());
                continue;
            };
            let terminal = matches!(event, FrameKind::Close | FrameKind::Error(_));
            if let Err(err) = sender.send(event).await {
                log::debug!(
                    "dropping inbound frame for closed stream {}: {:?}",
                    stream_id.value(),
                    err
                );
            }
            if terminal {
                lock_streams(&streams).remove(&stream_id);
            }
        }

        // Wake every open stream so readers observe the disconnect.
        let senders: Vec<Sender<FrameKind>> = lock_streams(&streams).drain().map(|(_, tx)| tx).collect();
        for sender in senders {
            let _ = sender.try_send(FrameKind::Error(unavailable("connection lost")));
        }
    });
}

pub struct MultiplexedStream {
    id: StreamId,
    metadata: StreamMetadata,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamTable,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload. `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        lock_streams(&self.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::close(self.id))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue close frame: {err}")))
    }

    /// Terminates the stream with `error` on the peer side.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        lock_streams(&self.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue error frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        if lock_streams(&self.streams).remove(&self.id).is_some() {
            let _ = self.outbound.try_send(TransportFrame::close(self.id));
        }
    }
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};

    fn connected_pair() -> (MultiplexedConnection, MultiplexedConnection) {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        (
            MultiplexedConnection::new(left_transport),
            MultiplexedConnection::new(right_transport),
        )
    }

    #[tokio::test]
    async fn accepted_stream_exchanges_payloads() {
        let (client, server) = connected_pair();

        let mut metadata = StreamMetadata::new("listen");
        metadata.auth_token = Some("token".into());
        let client_stream = client.open_stream(metadata).await.expect("client stream");
        let server_stream = server.accept_stream().await.expect("server stream");
        assert_eq!(server_stream.metadata().method, "listen");
        assert_eq!(server_stream.metadata().auth_token.as_deref(), Some("token"));

        client_stream.send(b"hello".to_vec()).await.expect("client send");
        let payload = server_stream.next().await.expect("server recv").expect("payload");
        assert_eq!(payload, b"hello");

        server_stream.send(b"world".to_vec()).await.expect("server send");
        let payload = client_stream.next().await.expect("client recv").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (client, server) = connected_pair();
        let client_stream = client.open_stream(StreamMetadata::new("write")).await.expect("client stream");
        let server_stream = server.accept_stream().await.expect("server stream");

        client_stream.close().await.expect("client close");
        assert!(server_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failed_stream_surfaces_error() {
        let (client, server) = connected_pair();
        let client_stream = client.open_stream(StreamMetadata::new("listen")).await.expect("client stream");
        let server_stream = server.accept_stream().await.expect("server stream");

        server_stream.fail(permission_denied("nope")).await.expect("fail");
        let err = client_stream.next().await.expect("event").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
    }
}
