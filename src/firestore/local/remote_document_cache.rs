use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::{PersistenceTransaction, Tables};
use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};

/// Last known server state of each document. Writes keep the field indexes
/// in step.
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    /// Cached document, or an invalid document when nothing is cached.
    pub fn get(tables: &Tables, key: &DocumentKey) -> MutableDocument {
        tables
            .remote_documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    pub fn get_all(
        tables: &Tables,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), Self::get(tables, key)))
            .collect()
    }

    /// Documents directly inside `collection` read after `since`.
    pub fn get_documents_in_collection(
        tables: &Tables,
        collection: &ResourcePath,
        since: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        tables
            .remote_documents
            .range(DocumentKey::collection_start(collection)..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, document)| {
                collection.is_immediate_parent_of(key.path()) && document.read_time() > since
            })
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect()
    }

    /// Number of documents a full scan of `collection` reads.
    pub fn collection_size(tables: &Tables, collection: &ResourcePath) -> usize {
        tables
            .remote_documents
            .range(DocumentKey::collection_start(collection)..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .count()
    }

    pub fn add(txn: &mut PersistenceTransaction<'_>, document: MutableDocument) {
        let previous = txn.tables().remote_documents.get(document.key()).cloned();
        IndexManager::update_entries(txn, previous.as_ref(), Some(&document));
        txn.put(Tables::remote_documents_mut, document.key().clone(), document);
    }

    pub fn remove(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        if let Some(previous) = txn.delete(Tables::remote_documents_mut, key) {
            IndexManager::update_entries(txn, Some(&previous), None);
        }
    }

    pub fn total_byte_size(tables: &Tables) -> usize {
        tables
            .remote_documents
            .values()
            .map(MutableDocument::estimated_byte_size)
            .sum()
    }
}
