//! Least-recently-used collection of cached targets and documents.
//!
//! Every target row and every document reference carries the listen
//! sequence number of its last use. A collection pass picks the sequence
//! number at the configured percentile and removes inactive targets and
//! orphaned documents at or below it.

use std::collections::BTreeSet;

use crate::firestore::local::mutation_queue::has_pending_mutations;
use crate::firestore::local::persistence::{PersistenceTransaction, Tables};
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetId};
use crate::firestore::model::DocumentKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size in bytes above which collection runs. `None` disables
    /// collection.
    pub cache_size_collection_threshold: Option<usize>,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub const DEFAULT_CACHE_SIZE_BYTES: usize = 40 * 1024 * 1024;

    pub fn with_cache_size(cache_size: usize) -> Self {
        Self {
            cache_size_collection_threshold: Some(cache_size),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: None,
            ..Self::default()
        }
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: Some(Self::DEFAULT_CACHE_SIZE_BYTES),
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

#[derive(Clone, Debug, Default)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs a pass when the cache has outgrown the configured threshold.
    /// Targets in `active_target_ids` and documents in `pinned_documents`
    /// (shown by an active view) survive regardless of sequence number.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned_documents: &BTreeSet<DocumentKey>,
    ) -> LruResults {
        let Some(threshold) = self.params.cache_size_collection_threshold else {
            log::debug!("garbage collection skipped; disabled");
            return LruResults::default();
        };
        let cache_size = cache_byte_size(txn.tables());
        if cache_size < threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is below threshold {threshold}"
            );
            return LruResults::default();
        }
        self.run_garbage_collection(txn, active_target_ids, pinned_documents)
    }

    /// Runs a pass regardless of cache size.
    pub fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned_documents: &BTreeSet<DocumentKey>,
    ) -> LruResults {
        let mut sequence_numbers = sequence_numbers(txn.tables(), pinned_documents);
        let count = sequence_numbers.len() * self.params.percentile_to_collect as usize / 100;
        let count = count.min(self.params.maximum_sequence_numbers_to_collect);
        if count == 0 {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        }
        sequence_numbers.sort_unstable();
        let upper_bound = sequence_numbers[count - 1];

        let targets_removed = remove_targets(txn, upper_bound, active_target_ids);
        let documents_removed = remove_orphaned_documents(txn, upper_bound, pinned_documents);
        let results = LruResults {
            did_run: true,
            sequence_numbers_collected: count,
            targets_removed,
            documents_removed,
        };
        log::debug!(
            "garbage collection up to sequence number {upper_bound}: {} targets and {} documents removed",
            results.targets_removed,
            results.documents_removed
        );
        results
    }
}

fn cache_byte_size(tables: &Tables) -> usize {
    let targets: usize = tables
        .targets
        .values()
        .map(|target| target.target.canonical_id().len() + target.resume_token.len())
        .sum();
    RemoteDocumentCache::total_byte_size(tables) + targets
}

fn keys_in_targets(tables: &Tables) -> BTreeSet<DocumentKey> {
    tables
        .target_documents
        .iter()
        .map(|(_, key)| key.clone())
        .collect()
}

/// Documents that no target holds, no view pins and no pending write
/// references, with their last sequence number.
fn orphaned_documents(
    tables: &Tables,
    pinned_documents: &BTreeSet<DocumentKey>,
) -> Vec<(DocumentKey, ListenSequenceNumber)> {
    let referenced = keys_in_targets(tables);
    tables
        .remote_documents
        .keys()
        .filter(|key| {
            !referenced.contains(*key)
                && !pinned_documents.contains(*key)
                && !has_pending_mutations(tables, key)
        })
        .map(|key| {
            let sequence_number = tables
                .document_sequence_numbers
                .get(key)
                .copied()
                .unwrap_or_default();
            (key.clone(), sequence_number)
        })
        .collect()
}

fn sequence_numbers(
    tables: &Tables,
    pinned_documents: &BTreeSet<DocumentKey>,
) -> Vec<ListenSequenceNumber> {
    tables
        .targets
        .values()
        .map(|target| target.sequence_number)
        .chain(
            orphaned_documents(tables, pinned_documents)
                .into_iter()
                .map(|(_, sequence_number)| sequence_number),
        )
        .collect()
}

fn remove_targets(
    txn: &mut PersistenceTransaction<'_>,
    upper_bound: ListenSequenceNumber,
    active_target_ids: &BTreeSet<TargetId>,
) -> usize {
    let removable: Vec<TargetId> = txn
        .tables()
        .targets
        .values()
        .filter(|target| {
            target.sequence_number <= upper_bound && !active_target_ids.contains(&target.target_id)
        })
        .map(|target| target.target_id)
        .collect();
    for target_id in &removable {
        txn.delete(Tables::targets_mut, target_id);
        txn.remove_members_in(
            Tables::target_documents_mut,
            (*target_id, DocumentKey::empty())..(*target_id + 1, DocumentKey::empty()),
        );
    }
    removable.len()
}

fn remove_orphaned_documents(
    txn: &mut PersistenceTransaction<'_>,
    upper_bound: ListenSequenceNumber,
    pinned_documents: &BTreeSet<DocumentKey>,
) -> usize {
    let removable: Vec<DocumentKey> = orphaned_documents(txn.tables(), pinned_documents)
        .into_iter()
        .filter(|(_, sequence_number)| *sequence_number <= upper_bound)
        .map(|(key, _)| key)
        .collect();
    for key in &removable {
        RemoteDocumentCache::remove(txn, key);
        txn.delete(Tables::document_sequence_numbers_mut, key);
    }
    removable.len()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{MemoryPersistence, Persistence};
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{Mutation, MutableDocument, SnapshotVersion, Timestamp, User};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add_target(txn: &mut PersistenceTransaction<'_>, target_id: TargetId, sequence_number: i64) {
        let target = Query::collection(&format!("c{target_id}")).unwrap().to_target();
        txn.put(
            Tables::targets_mut,
            target_id,
            TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number),
        );
    }

    fn add_document(txn: &mut PersistenceTransaction<'_>, path: &str, sequence_number: i64) {
        let document = MutableDocument::new_no_document(key(path), SnapshotVersion::from_micros(1));
        RemoteDocumentCache::add(txn, document);
        txn.put(Tables::document_sequence_numbers_mut, key(path), sequence_number);
    }

    #[test]
    fn disabled_params_never_run() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let gc = LruGarbageCollector::new(LruParams::disabled());
        let results = persistence
            .run_transaction("gc", |txn| Ok(gc.collect(txn, &BTreeSet::new(), &BTreeSet::new())))
            .unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn keeps_active_targets_and_referenced_documents() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: Some(0),
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let queue = MutationQueue::new(&User::unauthenticated());
        let results = persistence
            .run_transaction("gc", |txn| {
                add_target(txn, 2, 1);
                add_target(txn, 4, 2);
                add_document(txn, "rooms/held", 1);
                txn.insert_member(Tables::target_documents_mut, (2, key("rooms/held")));
                add_document(txn, "rooms/pending", 1);
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![Mutation::delete(key("rooms/pending"))],
                );
                add_document(txn, "rooms/orphan", 1);

                let active: BTreeSet<TargetId> = [2].into_iter().collect();
                let results = gc.collect(txn, &active, &BTreeSet::new());
                let tables = txn.tables();
                assert!(tables.targets.contains_key(&2));
                assert!(!tables.targets.contains_key(&4));
                assert!(tables.remote_documents.contains_key(&key("rooms/held")));
                assert!(tables.remote_documents.contains_key(&key("rooms/pending")));
                assert!(!tables.remote_documents.contains_key(&key("rooms/orphan")));
                Ok(results)
            })
            .unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
    }

    #[test]
    fn keeps_documents_pinned_by_a_view() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: Some(0),
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        persistence
            .run_transaction("gc", |txn| {
                add_document(txn, "rooms/limbo", 1);
                add_document(txn, "rooms/orphan", 1);
                let pinned: BTreeSet<DocumentKey> = [key("rooms/limbo")].into_iter().collect();
                let results = gc.collect(txn, &BTreeSet::new(), &pinned);
                assert_eq!(results.documents_removed, 1);
                assert!(txn.tables().remote_documents.contains_key(&key("rooms/limbo")));
                assert!(!txn.tables().remote_documents.contains_key(&key("rooms/orphan")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn collects_only_up_to_percentile() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: Some(0),
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1000,
        });
        persistence
            .run_transaction("gc", |txn| {
                for (i, path) in ["rooms/a", "rooms/b", "rooms/c", "rooms/d"].iter().enumerate() {
                    add_document(txn, path, i as i64 + 1);
                }
                let results = gc.collect(txn, &BTreeSet::new(), &BTreeSet::new());
                assert_eq!(results.sequence_numbers_collected, 2);
                assert_eq!(results.documents_removed, 2);
                assert!(txn.tables().remote_documents.contains_key(&key("rooms/c")));
                Ok(())
            })
            .unwrap();
    }
}
