use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::overlay::DocumentOverlayCache;
use crate::firestore::local::persistence::{PersistenceTransaction, Tables};
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    BatchId, DocumentKey, FieldMask, MutableDocument, Mutation, Overlay, SnapshotVersion,
    Timestamp, User,
};

/// Local view of documents: the remote document with its overlay applied.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    mutation_queue: MutationQueue,
    overlay_cache: DocumentOverlayCache,
}

impl LocalDocumentsView {
    pub fn new(user: &User) -> Self {
        Self {
            mutation_queue: MutationQueue::new(user),
            overlay_cache: DocumentOverlayCache::new(user),
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn overlay_cache(&self) -> &DocumentOverlayCache {
        &self.overlay_cache
    }

    pub fn get_document(&self, tables: &Tables, key: &DocumentKey) -> MutableDocument {
        let mut document = RemoteDocumentCache::get(tables, key);
        if let Some(overlay) = self.overlay_cache.get_overlay(tables, key) {
            apply_overlay(&mut document, &overlay);
        }
        document
    }

    pub fn get_documents(
        &self,
        tables: &Tables,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_document(tables, key)))
            .collect()
    }

    /// Applies the collection's overlays on top of `base` and keeps the
    /// documents matching `query`. Documents only known through an overlay
    /// are read from the remote cache first.
    pub fn merge_overlays_and_filter(
        &self,
        tables: &Tables,
        query: &Query,
        mut base: BTreeMap<DocumentKey, MutableDocument>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays = self
            .overlay_cache
            .overlays_for_collection(tables, query.path());
        for (key, overlay) in &overlays {
            let document = base
                .entry(key.clone())
                .or_insert_with(|| RemoteDocumentCache::get(tables, key));
            apply_overlay(document, overlay);
        }
        base.retain(|_, document| query.matches(document));
        base
    }

    /// Collection documents read after `since`, merged with every overlay
    /// of the collection.
    pub fn get_documents_matching_collection_query(
        &self,
        tables: &Tables,
        query: &Query,
        since: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let base = RemoteDocumentCache::get_documents_in_collection(tables, query.path(), since);
        self.merge_overlays_and_filter(tables, query, base)
    }

    /// Recomputes the overlay of each key from the remote document and every
    /// pending batch touching it, in batch order.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) {
        let tables = txn.tables();
        let batches = self.mutation_queue.batches_affecting_keys(tables, keys);
        let mut documents = RemoteDocumentCache::get_all(tables, keys);
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = keys
            .iter()
            .map(|key| (key.clone(), Some(FieldMask::empty())))
            .collect();
        let mut largest_batch: BTreeMap<DocumentKey, BatchId> = BTreeMap::new();

        for batch in &batches {
            for key in batch.keys() {
                let (Some(document), Some(mask)) = (documents.get_mut(&key), masks.get_mut(&key))
                else {
                    continue;
                };
                *mask = batch.apply_to_local_view(document, mask.take());
                largest_batch.insert(key, batch.batch_id);
            }
        }

        let mut by_batch: BTreeMap<BatchId, BTreeMap<DocumentKey, Mutation>> = BTreeMap::new();
        let mut stale = Vec::new();
        for (key, document) in &documents {
            let mask = masks
                .get(key)
                .cloned()
                .unwrap_or_else(|| Some(FieldMask::empty()));
            let overlay = Mutation::calculate_overlay(document, mask.as_ref());
            match (overlay, largest_batch.get(key)) {
                (Some(mutation), Some(batch_id)) => {
                    by_batch
                        .entry(*batch_id)
                        .or_default()
                        .insert(key.clone(), mutation);
                }
                _ => stale.push(key.clone()),
            }
        }

        for key in stale {
            self.overlay_cache.remove_overlay(txn, &key);
        }
        for (batch_id, overlays) in by_batch {
            self.overlay_cache.save_overlays(txn, batch_id, overlays);
        }
    }
}

fn apply_overlay(document: &mut MutableDocument, overlay: &Overlay) {
    // Overlays carry resolved values, so the write time is never consulted.
    overlay
        .mutation
        .apply_to_local_view(document, None, Timestamp::now());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, Persistence};
    use crate::firestore::model::{FieldPath, FieldTransform, Precondition, TransformOperation};
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn object(entries: &[(&str, i64)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (name, number) in entries {
            value.set(&field(name), FirestoreValue::from_integer(*number));
        }
        value
    }

    fn write(
        persistence: &Arc<dyn Persistence>,
        view: &LocalDocumentsView,
        mutations: Vec<Mutation>,
    ) {
        persistence
            .run_transaction("write", |txn| {
                let batch = view.mutation_queue().add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    mutations,
                );
                view.recalculate_and_save_overlays(txn, &batch.keys());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn folds_set_and_patch_into_one_set() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let view = LocalDocumentsView::new(&User::unauthenticated());
        write(&persistence, &view, vec![Mutation::set(key("rooms/a"), object(&[("x", 1)]))]);
        write(
            &persistence,
            &view,
            vec![Mutation::patch(
                key("rooms/a"),
                object(&[("y", 2)]),
                FieldMask::new([field("y")]),
                Precondition::None,
            )],
        );

        persistence
            .run_transaction("read", |txn| {
                let overlay = view
                    .overlay_cache()
                    .get_overlay(txn.tables(), &key("rooms/a"))
                    .unwrap();
                assert_eq!(overlay.largest_batch_id, 2);
                assert_eq!(
                    overlay.mutation,
                    Mutation::set(key("rooms/a"), object(&[("x", 1), ("y", 2)]))
                );
                let document = view.get_document(txn.tables(), &key("rooms/a"));
                assert!(document.has_pending_writes());
                assert_eq!(document.data(), &object(&[("x", 1), ("y", 2)]));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn recomputation_is_stable() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let view = LocalDocumentsView::new(&User::unauthenticated());
        let increment = Mutation::patch(key("rooms/a"), ObjectValue::empty(), FieldMask::empty(), Precondition::None)
            .with_transforms(vec![FieldTransform::new(
                field("count"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
            )]);
        write(&persistence, &view, vec![Mutation::set(key("rooms/a"), object(&[("count", 1)]))]);
        write(&persistence, &view, vec![increment]);

        let first = persistence
            .run_transaction("first", |txn| {
                Ok(view.overlay_cache().get_overlay(txn.tables(), &key("rooms/a")))
            })
            .unwrap();
        let second = persistence
            .run_transaction("again", |txn| {
                let keys: BTreeSet<DocumentKey> = [key("rooms/a")].into_iter().collect();
                view.recalculate_and_save_overlays(txn, &keys);
                view.recalculate_and_save_overlays(txn, &keys);
                Ok(view.overlay_cache().get_overlay(txn.tables(), &key("rooms/a")))
            })
            .unwrap();
        assert_eq!(first, second);
        let overlay = second.unwrap();
        assert_eq!(
            overlay.mutation,
            Mutation::set(key("rooms/a"), object(&[("count", 3)]))
        );
    }

    #[test]
    fn removes_overlay_when_no_batch_remains() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let view = LocalDocumentsView::new(&User::unauthenticated());
        write(&persistence, &view, vec![Mutation::delete(key("rooms/a"))]);
        persistence
            .run_transaction("reject", |txn| {
                let batch = view.mutation_queue().lookup_batch(txn.tables(), 1).unwrap();
                view.mutation_queue().remove_batch(txn, &batch);
                view.recalculate_and_save_overlays(txn, &batch.keys());
                assert!(view
                    .overlay_cache()
                    .get_overlay(txn.tables(), &key("rooms/a"))
                    .is_none());
                assert!(!view.get_document(txn.tables(), &key("rooms/a")).is_valid_document());
                Ok(())
            })
            .unwrap();
    }
}
