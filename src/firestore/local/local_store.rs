//! Local state of the client: pending writes, cached documents and targets.
//!
//! Every operation runs in a single persistence transaction. The in-memory
//! bookkeeping (active targets, current user, sequence numbers) sits behind
//! a std mutex that is never held across an await point.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::local::local_documents::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::persistence::{BundleMetadata, Persistence, PersistenceTransaction, Tables};
use crate::firestore::local::query_engine::{QueryEngine, QueryEngineSettings, QueryStrategy};
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_data::{
    ListenSequenceNumber, TargetData, TargetId, TargetIdGenerator, TargetPurpose,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, Timestamp, User,
};
use crate::firestore::remote::remote_event::RemoteEvent;

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
    pub strategy: QueryStrategy,
}

/// Keys a view started or stopped showing in one snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

struct LocalStoreState {
    user: User,
    local_documents: LocalDocumentsView,
    target_id_generator: TargetIdGenerator,
    listen_sequence_number: ListenSequenceNumber,
    targets: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, TargetId>,
    local_view_references: BTreeSet<(TargetId, DocumentKey)>,
}

impl LocalStoreState {
    fn next_sequence_number(&mut self, txn: &mut PersistenceTransaction<'_>) -> ListenSequenceNumber {
        self.listen_sequence_number += 1;
        let sequence_number = self.listen_sequence_number;
        txn.update_target_globals(|globals| {
            globals.highest_listen_sequence_number =
                globals.highest_listen_sequence_number.max(sequence_number)
        });
        sequence_number
    }
}

pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    query_engine: QueryEngine,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>, settings: QueryEngineSettings, user: User) -> Self {
        let state = LocalStoreState {
            local_documents: LocalDocumentsView::new(&user),
            user,
            target_id_generator: TargetIdGenerator::for_target_cache(0),
            listen_sequence_number: 0,
            targets: BTreeMap::new(),
            target_ids_by_canonical_id: BTreeMap::new(),
            local_view_references: BTreeSet::new(),
        };
        Self {
            persistence,
            query_engine: QueryEngine::new(settings),
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Restores the id generator and sequence number from persistence.
    pub fn start(&self) -> FirestoreResult<()> {
        let globals = self
            .persistence
            .run_transaction("Start LocalStore", |txn| Ok(txn.tables().target_globals.clone()))?;
        let mut state = self.lock_state();
        state.target_id_generator = TargetIdGenerator::for_target_cache(globals.highest_target_id);
        state.listen_sequence_number = globals.highest_listen_sequence_number;
        log::debug!(
            "local store started at sequence number {}, last remote version {}",
            globals.highest_listen_sequence_number,
            globals.last_remote_snapshot_version
        );
        Ok(())
    }

    pub fn user(&self) -> User {
        self.lock_state().user.clone()
    }

    /// Switches to `user`'s mutation queue. Returns the local view of every
    /// document either user has pending writes for.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<DocumentMap> {
        let mut state = self.lock_state();
        let state = &mut *state;
        self.persistence.run_transaction("Handle user change", |txn| {
            let tables = txn.tables();
            let mut keys = BTreeSet::new();
            for batch in state.local_documents.mutation_queue().all_batches(tables) {
                keys.extend(batch.keys());
            }
            let local_documents = LocalDocumentsView::new(&user);
            for batch in local_documents.mutation_queue().all_batches(tables) {
                keys.extend(batch.keys());
            }
            let changes = local_documents.get_documents(tables, &keys);
            state.local_documents = local_documents;
            state.user = user;
            Ok(changes)
        })
    }

    /// Queues `mutations` as one batch and returns the new local views.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(invalid_argument("A write batch needs at least one mutation"));
        }
        let local_write_time = Timestamp::now();
        let state = self.lock_state();
        let local_documents = &state.local_documents;
        self.persistence.run_transaction("Locally write mutations", |txn| {
            let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
            let overlayed = local_documents.get_documents(txn.tables(), &keys);
            let base_mutations: Vec<Mutation> = mutations
                .iter()
                .filter_map(|mutation| {
                    overlayed
                        .get(mutation.key())
                        .and_then(|document| mutation.extract_transform_base_mutation(document))
                })
                .collect();
            let batch = local_documents.mutation_queue().add_mutation_batch(
                txn,
                local_write_time,
                base_mutations,
                mutations,
            );
            local_documents.recalculate_and_save_overlays(txn, &keys);
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: local_documents.get_documents(txn.tables(), &keys),
            })
        })
    }

    pub fn get_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let state = self.lock_state();
        self.persistence.run_transaction("Read document", |txn| {
            Ok(state.local_documents.get_document(txn.tables(), key))
        })
    }

    pub fn get_documents_matching_query(&self, query: &Query) -> FirestoreResult<DocumentMap> {
        Ok(self.execute_query(query, false)?.documents)
    }

    /// Runs `query` against local state. With `use_previous_results`, the
    /// target's last consistent result seeds an incremental read.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let state = self.lock_state();
        let canonical_id = query.to_target().canonical_id();
        let active = state
            .target_ids_by_canonical_id
            .get(&canonical_id)
            .and_then(|target_id| state.targets.get(target_id))
            .cloned();
        self.persistence.run_transaction("Execute query", |txn| {
            let target_data =
                active.or_else(|| find_persisted_target(txn.tables(), &canonical_id));
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(data) => (
                    if use_previous_results {
                        data.last_limbo_free_snapshot_version
                    } else {
                        SnapshotVersion::min()
                    },
                    target_keys(txn.tables(), data.target_id),
                ),
                None => (SnapshotVersion::min(), BTreeSet::new()),
            };
            let result = self.query_engine.get_documents_matching_query(
                txn,
                &state.local_documents,
                query,
                last_limbo_free,
                &remote_keys,
            );
            Ok(QueryResult {
                documents: result.documents,
                remote_keys,
                strategy: result.strategy,
            })
        })
    }

    /// Applies one consistent watch pass. Returns the new local views of
    /// every document the event changed.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let remote_version = event.snapshot_version;
        let (updated_targets, changes) = self.persistence.run_transaction("Apply remote event", |txn| {
            if !remote_version.is_min() {
                let last = txn.tables().target_globals.last_remote_snapshot_version;
                if remote_version < last {
                    return Err(internal_error(format!(
                        "Watch stream reverted to snapshot {remote_version} after {last}"
                    )));
                }
            }
            let sequence_number = state.next_sequence_number(txn);

            let mut updated_targets = Vec::new();
            for (target_id, change) in &event.target_changes {
                let Some(old) = state.targets.get(target_id).cloned() else {
                    continue;
                };
                for key in &change.removed_documents {
                    txn.remove_member(Tables::target_documents_mut, &(*target_id, key.clone()));
                    touch_document(txn, key, sequence_number);
                }
                for key in &change.added_documents {
                    txn.insert_member(Tables::target_documents_mut, (*target_id, key.clone()));
                    touch_document(txn, key, sequence_number);
                }

                let mut updated = old.clone().with_sequence_number(sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    updated = updated
                        .with_resume_token(Vec::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() && remote_version >= old.snapshot_version {
                    updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                }
                txn.put(Tables::targets_mut, *target_id, updated.clone());
                updated_targets.push(updated);
            }

            let mut changed_keys = BTreeSet::new();
            for (key, document) in &event.document_updates {
                if event.resolved_limbo_documents.contains(key) {
                    touch_document(txn, key, sequence_number);
                }
                let existing = RemoteDocumentCache::get(txn.tables(), key);
                if document.is_no_document() && document.version().is_min() {
                    // Manufactured deletes mean access to the document was lost.
                    RemoteDocumentCache::remove(txn, key);
                    changed_keys.insert(key.clone());
                } else if !existing.is_valid_document()
                    || document.version() > existing.version()
                    || (document.version() == existing.version()
                        && existing.has_committed_mutations())
                {
                    let mut document = document.clone();
                    if !remote_version.is_min() {
                        document.set_read_time(remote_version);
                    }
                    RemoteDocumentCache::add(txn, document);
                    changed_keys.insert(key.clone());
                } else {
                    log::debug!(
                        "ignoring outdated watch update for {key}: cached version {}, update version {}",
                        existing.version(),
                        document.version()
                    );
                }
            }

            if !remote_version.is_min() {
                txn.update_target_globals(|globals| {
                    globals.last_remote_snapshot_version = remote_version
                });
            }

            let changes = state.local_documents.get_documents(txn.tables(), &changed_keys);
            Ok((updated_targets, changes))
        })?;

        for target_data in updated_targets {
            state.targets.insert(target_data.target_id, target_data);
        }
        Ok(changes)
    }

    /// Returns the target's data, allocating and persisting a new target id
    /// the first time a target is seen.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let canonical_id = target.canonical_id();
        if let Some(existing) = state
            .target_ids_by_canonical_id
            .get(&canonical_id)
            .and_then(|target_id| state.targets.get(target_id))
        {
            return Ok(existing.clone());
        }

        let target_data = self.persistence.run_transaction("Allocate target", |txn| {
            let sequence_number = state.next_sequence_number(txn);
            let target_data = match find_persisted_target(txn.tables(), &canonical_id) {
                Some(cached) => cached.with_sequence_number(sequence_number),
                None => {
                    let target_id = state.target_id_generator.next();
                    txn.update_target_globals(|globals| {
                        globals.highest_target_id = globals.highest_target_id.max(target_id)
                    });
                    TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number)
                }
            };
            txn.put(Tables::targets_mut, target_data.target_id, target_data.clone());
            Ok(target_data)
        })?;

        state
            .target_ids_by_canonical_id
            .insert(canonical_id, target_data.target_id);
        state.targets.insert(target_data.target_id, target_data.clone());
        Ok(target_data)
    }

    /// Stops tracking an active target. Its data stays persisted for the
    /// garbage collector to reclaim.
    pub fn release_target(&self, target_id: TargetId) -> FirestoreResult<()> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let Some(target_data) = state.targets.remove(&target_id) else {
            log::debug!("release of inactive target {target_id} ignored");
            return Ok(());
        };
        state
            .target_ids_by_canonical_id
            .remove(&target_data.target.canonical_id());
        let released: Vec<DocumentKey> = state
            .local_view_references
            .iter()
            .filter(|(id, _)| *id == target_id)
            .map(|(_, key)| key.clone())
            .collect();
        state
            .local_view_references
            .retain(|(id, _)| *id != target_id);

        self.persistence.run_transaction("Release target", |txn| {
            let sequence_number = state.next_sequence_number(txn);
            for key in &released {
                touch_document(txn, key, sequence_number);
            }
            txn.put(
                Tables::targets_mut,
                target_id,
                target_data.with_sequence_number(sequence_number),
            );
            Ok(())
        })
    }

    /// Applies a backend acknowledgement and drops the batch.
    pub fn acknowledge_batch(&self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let mut state = self.lock_state();
        let state = &mut *state;
        self.persistence.run_transaction("Acknowledge batch", |txn| {
            let sequence_number = state.next_sequence_number(txn);
            let local_documents = &state.local_documents;
            let batch = &batch_result.batch;
            local_documents.mutation_queue().acknowledge_batch(
                txn,
                batch.batch_id,
                batch_result.stream_token.clone(),
            );

            let keys = batch.keys();
            for key in &keys {
                let mut document = RemoteDocumentCache::get(txn.tables(), key);
                let ack_version = batch_result
                    .doc_versions
                    .get(key)
                    .copied()
                    .unwrap_or(batch_result.commit_version);
                if document.version() < ack_version {
                    batch.apply_to_remote_document(&mut document, batch_result);
                    if document.is_valid_document() {
                        document.set_read_time(batch_result.commit_version);
                        RemoteDocumentCache::add(txn, document);
                    }
                }
                touch_document(txn, key, sequence_number);
            }

            local_documents.mutation_queue().remove_batch(txn, batch);
            local_documents
                .overlay_cache()
                .remove_overlays_for_batch_id(txn, &keys, batch.batch_id);
            local_documents.recalculate_and_save_overlays(txn, &keys);
            Ok(local_documents.get_documents(txn.tables(), &keys))
        })
    }

    /// Drops a batch the backend refused and recomputes the affected views.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let state = self.lock_state();
        let local_documents = &state.local_documents;
        self.persistence.run_transaction("Reject batch", |txn| {
            let batch = local_documents
                .mutation_queue()
                .lookup_batch(txn.tables(), batch_id)
                .ok_or_else(|| internal_error(format!("Rejected batch {batch_id} is not queued")))?;
            let keys = batch.keys();
            local_documents.mutation_queue().remove_batch(txn, &batch);
            local_documents
                .overlay_cache()
                .remove_overlays_for_batch_id(txn, &keys, batch_id);
            local_documents.recalculate_and_save_overlays(txn, &keys);
            Ok(local_documents.get_documents(txn.tables(), &keys))
        })
    }

    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.lock_state();
        self.persistence.run_transaction("Get next mutation batch", |txn| {
            Ok(state
                .local_documents
                .mutation_queue()
                .next_batch_after(txn.tables(), after_batch_id))
        })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let state = self.lock_state();
        self.persistence.run_transaction("Get highest unacknowledged batch id", |txn| {
            Ok(state
                .local_documents
                .mutation_queue()
                .highest_unacknowledged_batch_id(txn.tables()))
        })
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let state = self.lock_state();
        self.persistence.run_transaction("Get last stream token", |txn| {
            Ok(state.local_documents.mutation_queue().last_stream_token(txn.tables()))
        })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let state = self.lock_state();
        self.persistence.run_transaction("Set last stream token", |txn| {
            state
                .local_documents
                .mutation_queue()
                .set_last_stream_token(txn, stream_token);
            Ok(())
        })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence.run_transaction("Remote document keys", |txn| {
            Ok(target_keys(txn.tables(), target_id))
        })
    }

    /// Active data for `target`, falling back to the persisted row.
    pub fn target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = target.canonical_id();
        let active = {
            let state = self.lock_state();
            state
                .target_ids_by_canonical_id
                .get(&canonical_id)
                .and_then(|target_id| state.targets.get(target_id))
                .cloned()
        };
        if active.is_some() {
            return Ok(active);
        }
        self.persistence.run_transaction("Get target data", |txn| {
            Ok(find_persisted_target(txn.tables(), &canonical_id))
        })
    }

    /// Records the documents each view references and advances the limbo-free
    /// version of targets whose views are consistent with the server.
    pub fn notify_local_view_changes(&self, changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut state = self.lock_state();
        let state = &mut *state;
        self.persistence.run_transaction("Notify local view changes", |txn| {
            let sequence_number = state.next_sequence_number(txn);
            for change in changes {
                for key in &change.added_keys {
                    state
                        .local_view_references
                        .insert((change.target_id, key.clone()));
                }
                for key in &change.removed_keys {
                    state
                        .local_view_references
                        .remove(&(change.target_id, key.clone()));
                    touch_document(txn, key, sequence_number);
                }
                if !change.from_cache {
                    if let Some(target_data) = state.targets.get_mut(&change.target_id) {
                        target_data.last_limbo_free_snapshot_version = target_data.snapshot_version;
                    }
                }
            }
            Ok(())
        })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence.run_transaction("Get last remote snapshot version", |txn| {
            Ok(txn.tables().target_globals.last_remote_snapshot_version)
        })
    }

    /// True when a bundle with the same id and an equal or newer create time
    /// has already been saved.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence.run_transaction("Has newer bundle", |txn| {
            Ok(txn
                .tables()
                .bundles
                .get(&metadata.id)
                .map(|saved| saved.create_time >= metadata.create_time)
                .unwrap_or(false))
        })
    }

    pub fn save_bundle(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.persistence.run_transaction("Save bundle", |txn| {
            txn.put(Tables::bundles_mut, metadata.id.clone(), metadata);
            Ok(())
        })
    }

    pub fn collect_garbage(&self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let (active, pinned) = {
            let state = self.lock_state();
            let active: BTreeSet<TargetId> = state.targets.keys().copied().collect();
            let pinned: BTreeSet<DocumentKey> = state
                .local_view_references
                .iter()
                .map(|(_, key)| key.clone())
                .collect();
            (active, pinned)
        };
        self.persistence.run_transaction("Collect garbage", |txn| {
            Ok(garbage_collector.collect(txn, &active, &pinned))
        })
    }
}

fn touch_document(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
    sequence_number: ListenSequenceNumber,
) {
    txn.put(
        Tables::document_sequence_numbers_mut,
        key.clone(),
        sequence_number,
    );
}

fn target_keys(tables: &Tables, target_id: TargetId) -> BTreeSet<DocumentKey> {
    tables
        .target_documents
        .range((target_id, DocumentKey::empty())..(target_id + 1, DocumentKey::empty()))
        .map(|(_, key)| key.clone())
        .collect()
}

fn find_persisted_target(tables: &Tables, canonical_id: &str) -> Option<TargetData> {
    tables
        .targets
        .values()
        .find(|data| data.target.canonical_id() == canonical_id)
        .cloned()
}
