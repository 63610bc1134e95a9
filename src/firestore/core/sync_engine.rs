//! Binds application queries to views and server targets.
//!
//! The sync engine owns one [`View`] per listened query, feeds it local
//! writes and remote events, and turns the view's limbo reports into
//! single-document limbo resolution targets. It implements [`RemoteSyncer`]
//! so the remote store can hand it watch snapshots and write results.
//!
//! Engine state sits behind a std mutex that is never held across an await.
//! Work for the remote store is collected as [`RemoteCommand`]s while the
//! lock is held and executed after it is released; listener callbacks are
//! dispatched the same way.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::core::event_manager::{
    dispatch_all, EventManager, ListenOptions, ListenerEvent, ListenerId, SnapshotCallback,
};
use crate::firestore::core::query::Query;
use crate::firestore::core::view::{ChangeType, LimboDocumentChange, View, ViewSnapshot};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    DocumentMap, LocalStore, LocalViewChanges, ListenSequenceNumber, TargetData, TargetId,
    TargetIdGenerator, TargetPurpose,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, MutationResult,
    SnapshotVersion, User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::{
    box_remote_store_future, RemoteStoreFuture, RemoteSyncer,
};

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Limbo targets are never persisted, so they carry no sequence number.
const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Per-mutation outcome of an acknowledged batch.
pub type WriteOutcome = Vec<FirestoreResult<MutationResult>>;

/// The eventual result of an operation completed by a later engine event.
pub struct Completion<T> {
    receiver: async_channel::Receiver<FirestoreResult<T>>,
}

impl<T> Completion<T> {
    fn channel() -> (async_channel::Sender<FirestoreResult<T>>, Self) {
        let (sender, receiver) = async_channel::bounded(1);
        (sender, Self { receiver })
    }

    fn resolved(value: T) -> Self {
        let (sender, completion) = Self::channel();
        let _ = sender.try_send(Ok(value));
        completion
    }

    /// Waits for the outcome. Fails with `cancelled` when the client shuts
    /// down first.
    pub async fn wait(self) -> FirestoreResult<T> {
        self.receiver.recv().await.unwrap_or_else(|_| {
            Err(cancelled(
                "The client was terminated before the operation completed",
            ))
        })
    }
}

/// A batch written to the local store and queued for the backend.
pub struct PendingWrite {
    batch_id: BatchId,
    completion: Completion<WriteOutcome>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Resolves when the backend acknowledged the batch, or fails with the
    /// error that made it reject the batch.
    pub async fn acknowledged(self) -> FirestoreResult<WriteOutcome> {
        self.completion.wait().await
    }
}

/// Remote store calls deferred until the engine lock is released.
#[derive(Debug)]
enum RemoteCommand {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// The limbo target delivered the document; its absence from a later
    /// pass means the document was deleted.
    received_document: bool,
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    event_manager: EventManager,
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which targets keep each limbo document alive.
    limbo_document_refs: BTreeSet<(DocumentKey, TargetId)>,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_callbacks: BTreeMap<String, BTreeMap<BatchId, async_channel::Sender<FirestoreResult<WriteOutcome>>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<async_channel::Sender<FirestoreResult<()>>>>,
}

impl SyncEngineState {
    fn has_limbo_reference(&self, key: &DocumentKey) -> bool {
        self.limbo_document_refs
            .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
            .next()
            .is_some()
    }
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    /// Creates the engine and registers it as the remote store's syncer.
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store,
            max_concurrent_limbo_resolutions,
            state: Mutex::new(SyncEngineState {
                current_user,
                online_state: OnlineState::Unknown,
                event_manager: EventManager::new(),
                query_views: HashMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: BTreeSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
        });
        let syncer: Arc<dyn RemoteSyncer> = engine.clone();
        engine.remote_store.set_syncer(Arc::downgrade(&syncer));
        engine
    }

    fn lock(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn current_user(&self) -> User {
        self.lock().current_user.clone()
    }

    /// Limbo documents with a resolution target in flight.
    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.lock().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot.
    pub fn enqueued_limbo_resolutions(&self) -> Vec<DocumentKey> {
        self.lock()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    /// Registers `callback` for `query`. The first listener of a query
    /// creates its view and starts watching its target.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> FirestoreResult<ListenerId> {
        let mut commands = Vec::new();
        let (listener_id, events) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let added = state
                .event_manager
                .add_listener(query.clone(), options, callback);
            let mut events = added.events;
            if added.first_listener {
                match self.listen_to_query(state, query, &mut commands) {
                    Ok(snapshot) => events.extend(state.event_manager.on_watch_change(vec![snapshot])),
                    Err(err) => {
                        state.event_manager.remove_listener(added.listener_id);
                        return Err(err);
                    }
                }
            }
            (added.listener_id, events)
        };
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(listener_id)
    }

    /// Removes a listener. The last listener of a query releases its target.
    pub async fn unlisten(&self, listener_id: ListenerId) -> FirestoreResult<()> {
        let mut commands = Vec::new();
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(query) = state.event_manager.remove_listener(listener_id) else {
                return Ok(());
            };
            self.stop_listening(state, &query, &mut commands, &mut events)?;
        }
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(())
    }

    /// Applies `mutations` locally, raises the optimistic snapshots and
    /// queues the batch for the backend.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let mut commands = Vec::new();
        let (pending, events) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let result = self.local_store.write_locally(mutations)?;
            let (sender, completion) = Completion::channel();
            state
                .mutation_callbacks
                .entry(state.current_user.to_key())
                .or_default()
                .insert(result.batch_id, sender);
            let events = self.emit_new_snapshots(state, &result.changes, None, &mut commands)?;
            let pending = PendingWrite {
                batch_id: result.batch_id,
                completion,
            };
            (pending, events)
        };
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        self.remote_store.fill_write_pipeline().await?;
        Ok(pending)
    }

    /// Resolves once every batch pending at the time of the call has been
    /// acknowledged or rejected.
    pub async fn register_pending_writes_task(&self) -> FirestoreResult<Completion<()>> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "the network is disabled; pending writes will not complete until it is enabled"
            );
        }
        let highest_batch_id = self.local_store.highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            return Ok(Completion::resolved(()));
        }
        let (sender, completion) = Completion::channel();
        self.lock()
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(sender);
        Ok(completion)
    }

    /// Stops the remote store and fails every outstanding waiter.
    pub async fn shutdown(&self) {
        self.remote_store.shutdown().await;
        let mut state = self.lock();
        state.mutation_callbacks.clear();
        state.pending_writes_callbacks.clear();
    }

    fn listen_to_query(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        commands: &mut Vec<RemoteCommand>,
    ) -> FirestoreResult<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        // Another query may already watch the same target.
        let existing_current = state
            .queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first())
            .and_then(|canonical_id| state.query_views.get(canonical_id))
            .map(|query_view| query_view.view.is_current());
        let current = existing_current.unwrap_or(false) && state.online_state != OnlineState::Offline;
        let snapshot = self.initialize_view(
            state,
            query,
            target_id,
            current,
            target_data.resume_token.clone(),
            commands,
        )?;
        commands.push(RemoteCommand::Listen(target_data));
        Ok(snapshot)
    }

    fn initialize_view(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
        commands: &mut Vec<RemoteCommand>,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None)?;
        let synthesized = TargetChange::new(resume_token, current);
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes, commands);

        let canonical_id = query.canonical_id();
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(canonical_id.clone());
        state.query_views.insert(
            canonical_id,
            QueryView {
                query,
                target_id,
                view,
            },
        );
        view_change
            .snapshot
            .ok_or_else(|| internal_error("a new view must produce an initial snapshot"))
    }

    fn stop_listening(
        &self,
        state: &mut SyncEngineState,
        query: &Query,
        commands: &mut Vec<RemoteCommand>,
        events: &mut Vec<ListenerEvent>,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = state
            .query_views
            .get(&canonical_id)
            .map(|query_view| query_view.target_id)
        else {
            return Ok(());
        };
        if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|id| id != &canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
        }
        self.local_store.release_target(target_id)?;
        commands.push(RemoteCommand::Unlisten(target_id));
        self.remove_and_cleanup_target(state, target_id, None, commands, events);
        Ok(())
    }

    fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        error: Option<FirestoreError>,
        commands: &mut Vec<RemoteCommand>,
        events: &mut Vec<ListenerEvent>,
    ) {
        for canonical_id in state.queries_by_target.remove(&target_id).unwrap_or_default() {
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                continue;
            };
            if let Some(error) = &error {
                events.extend(
                    state
                        .event_manager
                        .on_watch_error(&query_view.query, error.clone()),
                );
            }
        }

        let limbo_keys: Vec<DocumentKey> = state
            .limbo_document_refs
            .iter()
            .filter(|(_, id)| *id == target_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in limbo_keys {
            state.limbo_document_refs.remove(&(key.clone(), target_id));
            if !state.has_limbo_reference(&key) {
                self.remove_limbo_target(state, &key, commands);
            }
        }
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        commands: &mut Vec<RemoteCommand>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.insert((key.clone(), target_id));
                    self.track_limbo_change(state, key, commands);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} is no longer in limbo");
                    state.limbo_document_refs.remove(&(key.clone(), target_id));
                    if !state.has_limbo_reference(&key) {
                        self.remove_limbo_target(state, &key, commands);
                    }
                }
            }
        }
    }

    fn track_limbo_change(
        &self,
        state: &mut SyncEngineState,
        key: DocumentKey,
        commands: &mut Vec<RemoteCommand>,
    ) {
        if state.active_limbo_targets_by_key.contains_key(&key)
            || state.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("new document in limbo: {key}");
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state, commands);
    }

    /// Starts queued limbo resolutions while fewer than the configured
    /// maximum are in flight.
    fn pump_enqueued_limbo_resolutions(
        &self,
        state: &mut SyncEngineState,
        commands: &mut Vec<RemoteCommand>,
    ) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), target_id);
            commands.push(RemoteCommand::Listen(TargetData::new(
                Query::for_document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(
        &self,
        state: &mut SyncEngineState,
        key: &DocumentKey,
        commands: &mut Vec<RemoteCommand>,
    ) {
        state
            .enqueued_limbo_resolutions
            .retain(|queued| queued != key);
        if let Some(target_id) = state.active_limbo_targets_by_key.remove(key) {
            state.active_limbo_resolutions_by_target.remove(&target_id);
            commands.push(RemoteCommand::Unlisten(target_id));
            self.pump_enqueued_limbo_resolutions(state, commands);
        }
    }

    /// Recomputes every view against `changes` and records the keys each
    /// snapshot added or removed with the local store.
    fn emit_new_snapshots(
        &self,
        state: &mut SyncEngineState,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
        commands: &mut Vec<RemoteCommand>,
    ) -> FirestoreResult<Vec<ListenerEvent>> {
        let mut snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in state.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None)?;
            if doc_changes.needs_refill {
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes))?;
            }
            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let pending_reset = remote_event
                .is_some_and(|event| event.target_mismatches.contains_key(&query_view.target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);
            limbo_updates.push((query_view.target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(local_view_changes_of(query_view.target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(state, target_id, limbo_changes, commands);
        }
        let events = state.event_manager.on_watch_change(snapshots);
        self.local_store
            .notify_local_view_changes(&local_view_changes)?;
        Ok(events)
    }

    async fn run_remote_commands(&self, commands: Vec<RemoteCommand>) {
        for command in commands {
            match command {
                RemoteCommand::Listen(target_data) => self.remote_store.listen(target_data).await,
                RemoteCommand::Unlisten(target_id) => self.remote_store.unlisten(target_id).await,
            }
        }
    }

    async fn apply_remote_event_internal(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut commands = Vec::new();
        let events = {
            let mut guard = self.lock();
            let state = &mut *guard;
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id)
                else {
                    continue;
                };
                let total = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                if total > 1 {
                    return Err(internal_error(format!(
                        "limbo resolution target {target_id} reported {total} document changes"
                    )));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error(format!(
                            "limbo target {target_id} modified a document it never added"
                        )));
                    }
                } else if !change.removed_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error(format!(
                            "limbo target {target_id} removed a document it never added"
                        )));
                    }
                    resolution.received_document = false;
                }
            }

            let changes = self.local_store.apply_remote_event(&event)?;
            self.emit_new_snapshots(state, &changes, Some(&event), &mut commands)?
        };
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(())
    }

    async fn reject_listen_internal(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self
            .lock()
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        if let Some(key) = limbo_key {
            log::debug!("limbo resolution for {key} failed: {error}");
            // Treat the document as deleted; the listen that put it in limbo
            // has no way to confirm it.
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key.clone());
            self.apply_remote_event_internal(event).await?;

            let mut commands = Vec::new();
            {
                let mut guard = self.lock();
                let state = &mut *guard;
                state.active_limbo_targets_by_key.remove(&key);
                state.active_limbo_resolutions_by_target.remove(&target_id);
                self.pump_enqueued_limbo_resolutions(state, &mut commands);
            }
            self.run_remote_commands(commands).await;
            return Ok(());
        }

        let mut commands = Vec::new();
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            self.local_store.release_target(target_id)?;
            self.remove_and_cleanup_target(state, target_id, Some(error), &mut commands, &mut events);
        }
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(())
    }

    fn complete_batch(
        &self,
        state: &mut SyncEngineState,
        batch_id: BatchId,
        outcome: FirestoreResult<WriteOutcome>,
    ) {
        let user_key = state.current_user.to_key();
        if let Some(sender) = state
            .mutation_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id))
        {
            let _ = sender.try_send(outcome);
        }
        for sender in state
            .pending_writes_callbacks
            .remove(&batch_id)
            .unwrap_or_default()
        {
            let _ = sender.try_send(Ok(()));
        }
    }

    async fn apply_successful_write_internal(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let mut commands = Vec::new();
        let events = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let changes = self.local_store.acknowledge_batch(&result)?;
            self.complete_batch(state, result.batch.batch_id, Ok(result.results.clone()));
            self.emit_new_snapshots(state, &changes, None, &mut commands)?
        };
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(())
    }

    async fn reject_failed_write_internal(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("write batch {batch_id} was rejected: {error}");
        let mut commands = Vec::new();
        let events = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let changes = self.local_store.reject_batch(batch_id)?;
            self.complete_batch(state, batch_id, Err(error));
            self.emit_new_snapshots(state, &changes, None, &mut commands)?
        };
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(())
    }

    async fn handle_credential_change_internal(&self, user: User) -> FirestoreResult<()> {
        let mut commands = Vec::new();
        let events = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.current_user == user {
                return Ok(());
            }
            log::debug!("user changed to {:?}", user.uid());
            let changes = self.local_store.handle_user_change(user.clone())?;
            state.current_user = user;
            for (_, senders) in std::mem::take(&mut state.pending_writes_callbacks) {
                for sender in senders {
                    let _ = sender.try_send(Err(cancelled(
                        "waiting for pending writes was cancelled by a user change",
                    )));
                }
            }
            self.emit_new_snapshots(state, &changes, None, &mut commands)?
        };
        dispatch_all(events);
        self.run_remote_commands(commands).await;
        Ok(())
    }
}

fn local_view_changes_of(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_internal(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_internal(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.lock();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
            return BTreeSet::new();
        }
        let mut keys = BTreeSet::new();
        for canonical_id in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(canonical_id) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn handle_online_state_change(&self, online_state: OnlineState) {
        let events = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let snapshots: Vec<ViewSnapshot> = state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect();
            let mut events = state.event_manager.on_online_state_change(online_state);
            events.extend(state.event_manager.on_watch_change(snapshots));
            state.online_state = online_state;
            events
        };
        dispatch_all(events);
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_internal(user))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::firestore::core::async_queue::AsyncQueue;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{MemoryPersistence, QueryEngineSettings};
    use crate::firestore::model::{DatabaseId, FieldPath, Timestamp};
    use crate::firestore::remote::credentials::{StaticTokenProvider, TokenProviderArc};
    use crate::firestore::remote::datastore::StreamingDatastoreImpl;
    use crate::firestore::remote::network::NetworkLayer;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    struct Harness {
        engine: Arc<SyncEngine>,
        queue: AsyncQueue,
        snapshots: Arc<StdMutex<Vec<FirestoreResult<ViewSnapshot>>>>,
        _server: MultiplexedConnection,
    }

    fn harness(max_limbo: usize) -> Harness {
        let (left, right) = InMemoryTransport::pair();
        let auth: TokenProviderArc = Arc::new(StaticTokenProvider::new(User::unauthenticated(), None));
        let network = NetworkLayer::builder(
            Arc::new(StreamingDatastoreImpl::new(Arc::new(MultiplexedConnection::new(left)))),
            auth,
        )
        .build();
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            QueryEngineSettings::default(),
            User::unauthenticated(),
        ));
        local_store.start().unwrap();
        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            network,
            queue.clone(),
            DatabaseId::default("p"),
            Duration::from_secs(10),
        );
        Harness {
            engine: SyncEngine::new(local_store, remote_store, User::unauthenticated(), max_limbo),
            queue,
            snapshots: Arc::new(StdMutex::new(Vec::new())),
            _server: MultiplexedConnection::new(right),
        }
    }

    impl Harness {
        async fn listen(&self, query: Query) -> ListenerId {
            let engine = Arc::clone(&self.engine);
            let sink = Arc::clone(&self.snapshots);
            let callback: SnapshotCallback = Arc::new(move |result| sink.lock().unwrap().push(result));
            self.queue
                .enqueue_and_wait(async move {
                    engine
                        .listen(query, ListenOptions::default().with_metadata_changes(), callback)
                        .await
                })
                .await
                .unwrap()
        }

        async fn apply(&self, event: RemoteEvent) {
            let engine = Arc::clone(&self.engine);
            self.queue
                .enqueue_and_wait(async move { engine.apply_remote_event(event).await })
                .await
                .unwrap();
        }

        fn last_snapshot(&self) -> ViewSnapshot {
            self.snapshots
                .lock()
                .unwrap()
                .last()
                .expect("snapshot")
                .clone()
                .expect("snapshot result")
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    fn data(value: i64) -> ObjectValue {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(value));
        data
    }

    fn target_id_of(engine: &SyncEngine, query: &Query) -> TargetId {
        engine
            .local_store()
            .target_data(&query.to_target())
            .unwrap()
            .expect("target")
            .target_id
    }

    /// Event that makes `paths` the target's current result.
    fn sync_event(target_id: TargetId, paths: &[&str], at: i64) -> RemoteEvent {
        let mut change = TargetChange::new(vec![at as u8], true);
        let mut event = RemoteEvent {
            snapshot_version: version(at),
            ..RemoteEvent::default()
        };
        for path in paths {
            change.added_documents.insert(key(path));
            event
                .document_updates
                .insert(key(path), MutableDocument::new_found(key(path), version(at), data(1)));
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn local_write_raises_optimistic_snapshot() {
        let harness = harness(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        harness.listen(Query::collection("rooms").unwrap()).await;

        let engine = Arc::clone(&harness.engine);
        let pending = harness
            .queue
            .enqueue_and_wait(async move {
                engine
                    .write(vec![Mutation::set(key("rooms/a"), data(1))])
                    .await
            })
            .await
            .unwrap();
        assert_eq!(pending.batch_id(), 1);

        let snapshot = harness.last_snapshot();
        assert_eq!(snapshot.documents.len(), 1);
        assert!(snapshot.has_pending_writes());
        assert!(snapshot.from_cache);
    }

    #[tokio::test]
    async fn documents_dropped_by_the_server_enter_limbo_up_to_the_limit() {
        let harness = harness(1);
        let query = Query::collection("rooms").unwrap();
        harness.listen(query.clone()).await;
        let target_id = target_id_of(&harness.engine, &query);

        harness
            .apply(sync_event(target_id, &["rooms/a", "rooms/b", "rooms/c"], 1))
            .await;
        assert!(!harness.last_snapshot().from_cache);

        let mut change = TargetChange::new(vec![2], true);
        change.removed_documents = BTreeSet::from([key("rooms/a"), key("rooms/b"), key("rooms/c")]);
        let mut event = RemoteEvent {
            snapshot_version: version(2),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(target_id, change);
        harness.apply(event).await;

        let active = harness.engine.active_limbo_resolutions();
        assert_eq!(active.len(), 1);
        assert_eq!(harness.engine.enqueued_limbo_resolutions().len(), 2);
        assert!(harness.last_snapshot().from_cache);

        // A rejected resolution deletes the document and frees the slot.
        let (limbo_key, limbo_target) = active.into_iter().next().unwrap();
        let engine = Arc::clone(&harness.engine);
        harness
            .queue
            .enqueue_and_wait(async move {
                engine
                    .reject_listen(limbo_target, permission_denied("denied"))
                    .await
            })
            .await
            .unwrap();

        let active = harness.engine.active_limbo_resolutions();
        assert_eq!(active.len(), 1);
        assert!(!active.contains_key(&limbo_key));
        assert_eq!(harness.engine.enqueued_limbo_resolutions().len(), 1);
        assert!(!harness.last_snapshot().documents.contains(&limbo_key));
    }

    #[tokio::test]
    async fn rejected_listen_reports_error_to_listeners() {
        let harness = harness(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let query = Query::collection("rooms").unwrap();
        harness.listen(query.clone()).await;
        let target_id = target_id_of(&harness.engine, &query);

        let engine = Arc::clone(&harness.engine);
        harness
            .queue
            .enqueue_and_wait(async move {
                engine
                    .reject_listen(target_id, permission_denied("missing permissions"))
                    .await
            })
            .await
            .unwrap();

        let snapshots = harness.snapshots.lock().unwrap();
        let error = snapshots.last().unwrap().as_ref().unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        assert!(harness.engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn rejected_write_fails_its_waiter_and_reverts_the_view() {
        let harness = harness(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        harness.listen(Query::collection("rooms").unwrap()).await;

        let engine = Arc::clone(&harness.engine);
        let pending = harness
            .queue
            .enqueue_and_wait(async move {
                engine
                    .write(vec![Mutation::set(key("rooms/a"), data(1))])
                    .await
            })
            .await
            .unwrap();
        let batch_id = pending.batch_id();

        let engine = Arc::clone(&harness.engine);
        harness
            .queue
            .enqueue_and_wait(async move {
                engine
                    .reject_failed_write(batch_id, permission_denied("nope"))
                    .await
            })
            .await
            .unwrap();

        let error = pending.acknowledged().await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        assert!(harness.last_snapshot().documents.is_empty());
    }

    #[tokio::test]
    async fn going_offline_marks_views_from_cache() {
        let harness = harness(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS);
        let query = Query::collection("rooms").unwrap();
        harness.listen(query.clone()).await;
        let target_id = target_id_of(&harness.engine, &query);
        harness.apply(sync_event(target_id, &["rooms/a"], 1)).await;
        assert!(!harness.last_snapshot().from_cache);

        harness.engine.handle_online_state_change(OnlineState::Offline);
        assert!(harness.last_snapshot().from_cache);
    }
}
