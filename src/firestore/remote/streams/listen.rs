use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{TargetData, TargetId};
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::stream::{PersistentStream, StreamEventHandler, StreamKind};
use crate::firestore::remote::watch_change::{ListenRequest, WatchChange, WatchTarget};

/// Receives decoded listen-stream events.
#[async_trait]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    async fn on_listen_open(&self);

    /// `snapshot_version` is set only for global target changes that carry a
    /// read time; everything else reports [`SnapshotVersion::min`].
    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion);

    async fn on_listen_close(&self, error: Option<FirestoreError>);
}

struct ListenStreamHandler {
    delegate: Arc<dyn ListenStreamDelegate>,
}

#[async_trait]
impl StreamEventHandler for ListenStreamHandler {
    async fn on_open(&self) {
        self.delegate.on_listen_open().await;
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let change = WatchChange::decode(&payload)?;
        let snapshot_version = snapshot_version_of(&change);
        self.delegate.on_watch_change(change, snapshot_version).await;
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        self.delegate.on_listen_close(error).await;
    }
}

fn snapshot_version_of(change: &WatchChange) -> SnapshotVersion {
    match change {
        WatchChange::TargetChange(change) if change.target_ids.is_empty() => change
            .read_time
            .map(SnapshotVersion::from_timestamp)
            .unwrap_or_else(SnapshotVersion::min),
        _ => SnapshotVersion::min(),
    }
}

/// The add-target request for `target_data`, resuming from its token or,
/// failing that, from its snapshot version.
pub fn watch_target_for(target_data: &TargetData) -> WatchTarget {
    let mut target = WatchTarget {
        target_id: target_data.target_id,
        query: target_data.target.clone(),
        resume_token: Vec::new(),
        read_time: None,
        expected_count: None,
    };
    if !target_data.resume_token.is_empty() {
        target.resume_token = target_data.resume_token.clone();
        target.expected_count = target_data.expected_count;
    } else if !target_data.snapshot_version.is_min() {
        target.read_time = Some(target_data.snapshot_version.timestamp());
        target.expected_count = target_data.expected_count;
    }
    target
}

/// The listen stream: sends add/remove target requests and reports every
/// watch change to its delegate.
#[derive(Clone)]
pub struct ListenStream {
    stream: PersistentStream<ListenStreamHandler>,
}

impl ListenStream {
    pub fn new(queue: AsyncQueue, network: NetworkLayer, delegate: Arc<dyn ListenStreamDelegate>) -> Self {
        let handler = Arc::new(ListenStreamHandler { delegate });
        Self {
            stream: PersistentStream::new(StreamKind::Listen, queue, network, handler),
        }
    }

    pub fn start(&self) {
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

    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        self.send(&ListenRequest::AddTarget(watch_target_for(target_data)))
            .await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.send(&ListenRequest::RemoveTarget(target_id)).await
    }

    async fn send(&self, request: &ListenRequest) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("failed to encode listen request: {err}")))?;
        self.stream.send(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{Timestamp, User};
    use crate::firestore::remote::credentials::{StaticTokenProvider, TokenProviderArc};
    use crate::firestore::remote::datastore::StreamingDatastoreImpl;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::remote::watch_change::{TargetChangeState, WatchTargetChange};

    struct Recorder {
        changes: async_channel::Sender<(WatchChange, SnapshotVersion)>,
        opened: async_channel::Sender<()>,
    }

    #[async_trait]
    impl ListenStreamDelegate for Recorder {
        async fn on_listen_open(&self) {
            let _ = self.opened.send(()).await;
        }

        async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
            let _ = self.changes.send((change, snapshot_version)).await;
        }

        async fn on_listen_close(&self, _error: Option<FirestoreError>) {}
    }

    fn target_data() -> TargetData {
        TargetData::new(Query::collection("rooms").unwrap().to_target(), 2, TargetPurpose::Listen, 1)
    }

    #[test]
    fn resume_token_takes_precedence_over_read_time() {
        let version = SnapshotVersion::from_timestamp(Timestamp::new(8, 0));
        let data = target_data()
            .with_resume_token(vec![7], version)
            .with_expected_count(3);
        let target = watch_target_for(&data);
        assert_eq!(target.resume_token, vec![7]);
        assert_eq!(target.read_time, None);
        assert_eq!(target.expected_count, Some(3));

        let fresh = watch_target_for(&target_data());
        assert!(fresh.resume_token.is_empty());
        assert_eq!(fresh.expected_count, None);
    }

    #[tokio::test]
    async fn sends_targets_and_reports_global_snapshots() {
        let (left, right) = InMemoryTransport::pair();
        let server = MultiplexedConnection::new(right);
        let auth: TokenProviderArc = Arc::new(StaticTokenProvider::new(User::unauthenticated(), None));
        let network = NetworkLayer::builder(
            Arc::new(StreamingDatastoreImpl::new(Arc::new(MultiplexedConnection::new(left)))),
            auth,
        )
        .build();
        let queue = AsyncQueue::new();
        let (changes_tx, changes) = async_channel::unbounded();
        let (opened_tx, opened) = async_channel::unbounded();
        let stream = ListenStream::new(
            queue.clone(),
            network,
            Arc::new(Recorder {
                changes: changes_tx,
                opened: opened_tx,
            }),
        );

        let starter = stream.clone();
        queue.enqueue(async move { starter.start() }).unwrap();
        let peer = server.accept_stream().await.unwrap();
        opened.recv().await.unwrap();

        let watcher = stream.clone();
        queue
            .enqueue_and_wait(async move { watcher.watch(&target_data()).await })
            .await
            .unwrap();
        let request: ListenRequest = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(request, ListenRequest::AddTarget(ref target) if target.target_id == 2));

        let global = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(Timestamp::new(4, 0)),
        );
        peer.send(global.encode().unwrap()).await.unwrap();
        let (change, version) = changes.recv().await.unwrap();
        assert_eq!(change, global);
        assert_eq!(version, SnapshotVersion::from_timestamp(Timestamp::new(4, 0)));

        let scoped = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_read_time(Timestamp::new(5, 0)),
        );
        peer.send(scoped.encode().unwrap()).await.unwrap();
        let (_, version) = changes.recv().await.unwrap();
        assert!(version.is_min());
    }
}
