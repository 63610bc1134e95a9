//! Drives the listen and write streams on behalf of the sync engine.
//!
//! The remote store keeps the set of targets that should be watched and the
//! pipeline of mutation batches sent but not yet acknowledged. Both survive
//! stream restarts: targets are re-sent whenever the listen stream opens and
//! the pipeline is re-sent after every write handshake.
//!
//! All methods run as jobs on the [`AsyncQueue`]. State is guarded by an
//! async lock that is released before any call into the [`RemoteSyncer`],
//! because the syncer routinely calls back into the store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::async_queue::AsyncQueue;
use crate::firestore::error::{internal_error, ErrorCategory, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData, TargetId};
use crate::firestore::model::{
    DatabaseId, DocumentKey, Mutation, MutationBatch, MutationBatchResult, MutationResult,
    SnapshotVersion, User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::streams::{
    ListenStream, ListenStreamDelegate, WriteStream, WriteStreamDelegate,
};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};

/// Batches sent to the backend and not yet acknowledged.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons the network is not used. Streams run only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    ConnectivityChange,
    Shutdown,
    PersistenceFailure,
}

#[derive(Default)]
struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the listen stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }
}

struct StoreMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<Arc<dyn RemoteSyncer>>,
    database_id: &'a DatabaseId,
}

impl TargetMetadataProvider for StoreMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer
            .as_ref()
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        network: NetworkLayer,
        queue: AsyncQueue,
        database_id: DatabaseId,
        online_state_timeout: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|store: &Weak<RemoteStoreInner>| {
            let watch_stream = ListenStream::new(
                queue.clone(),
                network.clone(),
                Arc::new(WatchDelegate {
                    store: store.clone(),
                }),
            );
            let write_stream = WriteStream::new(
                queue.clone(),
                network,
                Arc::new(WriteDelegate {
                    store: store.clone(),
                }),
            );
            let handler_store = store.clone();
            let online_state = OnlineStateTracker::new(
                queue.clone(),
                online_state_timeout,
                Arc::new(move |state| {
                    if let Some(syncer) = handler_store.upgrade().and_then(|store| store.syncer()) {
                        syncer.handle_online_state_change(state);
                    }
                }),
            );
            RemoteStoreInner {
                state: Mutex::new(RemoteStoreState::default()),
                local_store,
                queue,
                database_id,
                watch_stream,
                write_stream,
                online_state,
                syncer: StdMutex::new(None),
            }
        });
        Self { inner }
    }

    /// Wires the store to the sync engine. Held weakly; the sync engine owns
    /// the remote store.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self
            .inner
            .syncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(syncer);
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    /// Starts the streams needed for the current targets and pending writes.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        let result = self.inner.enable_network_internal().await;
        self.inner.recover(result).await
    }

    /// Stops both streams and reports `Offline` until re-enabled.
    pub async fn disable_network(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
            self.inner.disable_network_internal(&mut state);
        }
        self.inner.online_state.set(OnlineState::Offline);
    }

    pub async fn shutdown(&self) {
        log::debug!("remote store shutting down");
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            self.inner.disable_network_internal(&mut state);
        }
        self.inner.online_state.set(OnlineState::Unknown);
    }

    /// Restarts both streams with the new user's credentials after the
    /// syncer has switched its local state to `user`.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("remote store received new credentials");
        let used_network = {
            let mut state = self.inner.state.lock().await;
            let used_network = state.can_use_network();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            self.inner.disable_network_internal(&mut state);
            used_network
        };
        if used_network {
            self.inner.online_state.set(OnlineState::Unknown);
        }
        let switched = match self.inner.syncer() {
            Some(syncer) => syncer.handle_credential_change(user).await,
            None => Ok(()),
        };
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        switched?;
        let result = self.inner.enable_network_internal().await;
        self.inner.recover(result).await
    }

    /// Tears down and reconnects both streams, for example after the
    /// device's network connectivity changed.
    pub async fn handle_connectivity_change(&self) -> FirestoreResult<()> {
        log::debug!("remote store restarting streams for a connectivity change");
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.insert(OfflineCause::ConnectivityChange);
            self.inner.disable_network_internal(&mut state);
        }
        self.inner.online_state.set(OnlineState::Unknown);
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::ConnectivityChange);
        let result = self.inner.enable_network_internal().await;
        self.inner.recover(result).await
    }

    /// Starts watching `target_data` unless it is watched already.
    pub async fn listen(&self, target_data: TargetData) {
        let mut state = self.inner.state.lock().await;
        if state.listen_targets.contains_key(&target_data.target_id) {
            return;
        }
        state
            .listen_targets
            .insert(target_data.target_id, target_data.clone());
        if self.inner.should_start_watch_stream(&state) {
            self.inner.start_watch_stream(&mut state);
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(&mut state, target_data).await;
        }
    }

    pub async fn unlisten(&self, target_id: TargetId) {
        let mut state = self.inner.state.lock().await;
        if state.listen_targets.remove(&target_id).is_none() {
            log::debug!("unlisten for unknown target {target_id}");
            return;
        }
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(&mut state, target_id).await;
        }
        if state.listen_targets.is_empty() {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if state.can_use_network() {
                // Nothing to watch, so there is no way to tell whether the
                // backend is reachable.
                self.inner.online_state.set(OnlineState::Unknown);
            }
        }
    }

    /// Pulls pending batches from the local store into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let result = self.inner.fill_write_pipeline().await;
        self.inner.recover(result).await
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    database_id: DatabaseId,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state: OnlineStateTracker,
    syncer: StdMutex<Option<Weak<dyn RemoteSyncer>>>,
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.watch_stream.is_started()
            && !state.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && state.write_pipeline.len() < MAX_PENDING_WRITES
    }

    /// Persistence failures take the network down until a cache read
    /// succeeds; everything else is returned unchanged.
    async fn recover(self: &Arc<Self>, result: FirestoreResult<()>) -> FirestoreResult<()> {
        match result {
            Err(err) if err.category() == ErrorCategory::PersistenceUnavailable => {
                self.disable_network_until_recovery(err).await;
                Ok(())
            }
            other => other,
        }
    }

    async fn disable_network_until_recovery(self: &Arc<Self>, error: FirestoreError) {
        log::warn!("disabling the network until persistence is available again: {error}");
        {
            let mut state = self.state.lock().await;
            if !state.offline_causes.insert(OfflineCause::PersistenceFailure) {
                return;
            }
            self.disable_network_internal(&mut state);
        }
        self.online_state.set(OnlineState::Offline);

        let store = Arc::downgrade(self);
        self.queue.enqueue_retryable(move || {
            let store = store.clone();
            async move {
                let Some(store) = store.upgrade() else {
                    return Ok(());
                };
                store.local_store.last_remote_snapshot_version()?;
                log::debug!("persistence recovered, re-enabling the network");
                store
                    .state
                    .lock()
                    .await
                    .offline_causes
                    .remove(&OfflineCause::PersistenceFailure);
                store.enable_network_internal().await
            }
        });
    }

    fn disable_network_internal(&self, state: &mut RemoteStoreState) {
        self.write_stream.stop();
        self.watch_stream.stop();
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if !state.can_use_network() {
                return Ok(());
            }
            self.watch_stream.inhibit_backoff();
            if self.should_start_watch_stream(&state) {
                self.start_watch_stream(&mut state);
            } else {
                self.online_state.set(OnlineState::Unknown);
            }
        }
        self.write_stream.inhibit_backoff();
        self.fill_write_pipeline().await
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        state.watch_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        self.online_state.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, state: &mut RemoteStoreState, target_data: TargetData) {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        let target_data = if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            let expected_count = self
                .syncer()
                .map(|syncer| syncer.get_remote_keys_for_target(target_data.target_id).len())
                .unwrap_or(0);
            target_data.with_expected_count(expected_count as i32)
        } else {
            target_data
        };
        if let Err(err) = self.watch_stream.watch(&target_data).await {
            log::debug!("failed to send watch request for target {}: {err}", target_data.target_id);
        }
    }

    async fn send_unwatch_request(&self, state: &mut RemoteStoreState, target_id: TargetId) {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Err(err) = self.watch_stream.unwatch(target_id).await {
            log::debug!("failed to send unwatch request for target {target_id}: {err}");
        }
    }

    async fn on_watch_stream_open(&self) {
        let mut state = self.state.lock().await;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(&mut state, target_data).await;
        }
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
        let mut state = self.state.lock().await;
        state.watch_aggregator = None;
        if self.should_start_watch_stream(&state) {
            if let Some(err) = &error {
                self.online_state.handle_watch_stream_failure(err);
            }
            self.start_watch_stream(&mut state);
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        self.online_state.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    return self
                        .handle_target_error(&target_change.target_ids, cause.to_error())
                        .await;
                }
            }
        }

        let event = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = StoreMetadata {
                listen_targets: &state.listen_targets,
                syncer: self.syncer(),
                database_id: &self.database_id,
            };
            aggregator.handle_watch_change(change, &metadata);
            if snapshot_version.is_min()
                || snapshot_version < self.local_store.last_remote_snapshot_version()?
            {
                return Ok(());
            }
            let event = aggregator.create_remote_event(snapshot_version, &metadata);
            self.update_targets_for_event(state, &event, snapshot_version)
                .await;
            event
        };

        match self.syncer() {
            Some(syncer) => syncer.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    /// Stores new resume tokens and re-listens to targets whose existence
    /// filter did not match.
    async fn update_targets_for_event(
        &self,
        state: &mut RemoteStoreState,
        event: &RemoteEvent,
        snapshot_version: SnapshotVersion,
    ) {
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = state.listen_targets.remove(target_id) {
                state.listen_targets.insert(
                    *target_id,
                    target_data.with_resume_token(change.resume_token.clone(), snapshot_version),
                );
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = state.listen_targets.get(target_id).cloned() else {
                continue;
            };
            let snapshot_version = target_data.snapshot_version;
            state.listen_targets.insert(
                *target_id,
                target_data
                    .clone()
                    .with_resume_token(Vec::new(), snapshot_version),
            );
            self.send_unwatch_request(state, *target_id).await;
            let request = TargetData::new(
                target_data.target,
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(state, request).await;
        }
    }

    async fn handle_target_error(&self, target_ids: &[TargetId], error: FirestoreError) -> FirestoreResult<()> {
        for target_id in target_ids {
            let removed = {
                let mut state = self.state.lock().await;
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if !removed {
                continue;
            }
            log::debug!("target {target_id} rejected by the backend: {error}");
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(*target_id, error.clone()).await?;
            }
        }
        Ok(())
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let mut last_batch_id = state
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while self.can_add_to_write_pipeline(&state) {
            match self.local_store.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(&mut state, batch).await;
                }
                None => {
                    if state.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, state: &mut RemoteStoreState, batch: MutationBatch) {
        let mutations = batch.mutations.clone();
        state.write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.send_mutations(mutations).await;
        }
    }

    async fn send_mutations(&self, mutations: Vec<Mutation>) {
        if let Err(err) = self.write_stream.write_mutations(mutations).await {
            log::debug!("failed to send mutations: {err}");
        }
    }

    async fn on_write_stream_open(&self) {
        if let Err(err) = self.write_stream.write_handshake().await {
            log::debug!("failed to send write handshake: {err}");
        }
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token())?;
        let state = self.state.lock().await;
        for batch in &state.write_pipeline {
            self.send_mutations(batch.mutations.clone()).await;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<FirestoreResult<MutationResult>>,
    ) -> FirestoreResult<()> {
        let result = {
            let mut state = self.state.lock().await;
            let batch = state
                .write_pipeline
                .pop_front()
                .ok_or_else(|| internal_error("write response without a pending batch"))?;
            MutationBatchResult::from(
                batch,
                commit_version,
                results,
                self.write_stream.last_stream_token(),
            )?
        };
        if let Some(syncer) = self.syncer() {
            syncer.apply_successful_write(result).await?;
        }
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            let pending = !self.state.lock().await.write_pipeline.is_empty();
            if pending {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(&error)?;
                }
            }
        }
        let state = self.state.lock().await;
        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.is_permanent_write_error() {
            return Ok(());
        }
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            return Ok(());
        };
        log::debug!("write batch {} rejected: {error}", batch.batch_id);
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            syncer.reject_failed_write(batch.batch_id, error).await?;
        }
        self.fill_write_pipeline().await
    }

    fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if error.is_permanent_write_error() {
            log::debug!("write handshake failed, dropping the stream token: {error}");
            self.write_stream.set_last_stream_token(Vec::new());
            self.local_store.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }
}

struct WatchDelegate {
    store: Weak<RemoteStoreInner>,
}

#[async_trait]
impl ListenStreamDelegate for WatchDelegate {
    async fn on_listen_open(&self) {
        if let Some(store) = self.store.upgrade() {
            store.on_watch_stream_open().await;
        }
    }

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
        if let Some(store) = self.store.upgrade() {
            let result = store.on_watch_change(change, snapshot_version).await;
            if let Err(err) = store.recover(result).await {
                log::warn!("failed to apply watch change: {err}");
            }
        }
    }

    async fn on_listen_close(&self, error: Option<FirestoreError>) {
        if let Some(store) = self.store.upgrade() {
            store.on_watch_stream_close(error).await;
        }
    }
}

struct WriteDelegate {
    store: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamDelegate for WriteDelegate {
    async fn on_write_open(&self) {
        if let Some(store) = self.store.upgrade() {
            store.on_write_stream_open().await;
        }
    }

    async fn on_handshake_complete(&self) {
        if let Some(store) = self.store.upgrade() {
            let result = store.on_write_handshake_complete().await;
            if let Err(err) = store.recover(result).await {
                log::warn!("failed to complete write handshake: {err}");
            }
        }
    }

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<FirestoreResult<MutationResult>>,
    ) {
        if let Some(store) = self.store.upgrade() {
            let result = store.on_mutation_result(commit_version, results).await;
            if let Err(err) = store.recover(result).await {
                log::warn!("failed to apply write acknowledgement: {err}");
            }
        }
    }

    async fn on_write_close(&self, error: Option<FirestoreError>) {
        if let Some(store) = self.store.upgrade() {
            let result = store.on_write_stream_close(error).await;
            if let Err(err) = store.recover(result).await {
                log::warn!("failed to handle write stream close: {err}");
            }
        }
    }
}
