//! Chooses how to answer a query from local state.
//!
//! In order of preference: a direct lookup for single-document queries, a
//! field-index lookup, an incremental re-read of a previous result, and a
//! full scan of the collection. A full scan that reads many more documents
//! than it returns creates an index for the next run.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryEngineSettings {
    pub index_auto_creation_enabled: bool,
    pub min_collection_size_to_auto_create_index: usize,
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineSettings {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: true,
            min_collection_size_to_auto_create_index: 100,
            relative_index_read_cost_per_document: 8.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    DocumentLookup,
    IndexLookup,
    Incremental,
    FullScan,
}

#[derive(Clone, Debug)]
pub struct QueryEngineResult {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    pub strategy: QueryStrategy,
}

#[derive(Clone, Debug, Default)]
pub struct QueryEngine {
    settings: QueryEngineSettings,
}

impl QueryEngine {
    pub fn new(settings: QueryEngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QueryEngineSettings {
        &self.settings
    }

    /// Matching documents with overlays applied. Limits are not applied
    /// here; the view trims the sorted result.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> QueryEngineResult {
        if query.is_document_query() {
            return self.perform_document_lookup(txn, local_documents, query);
        }
        if let Some(result) = self.perform_index_lookup(txn, local_documents, query) {
            return result;
        }
        if let Some(result) = self.perform_incremental(
            txn,
            local_documents,
            query,
            last_limbo_free_snapshot_version,
            remote_keys,
        ) {
            return result;
        }
        self.perform_full_scan(txn, local_documents, query)
    }

    fn perform_document_lookup(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> QueryEngineResult {
        let mut documents = BTreeMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = local_documents.get_document(txn.tables(), &key);
            if query.matches(&document) {
                documents.insert(key, document);
            }
        }
        QueryEngineResult {
            documents,
            strategy: QueryStrategy::DocumentLookup,
        }
    }

    fn perform_index_lookup(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> Option<QueryEngineResult> {
        let tables = txn.tables();
        let IndexType::Full(index) = IndexManager::index_type(tables, query) else {
            return None;
        };
        let keys = IndexManager::candidate_keys(tables, &index, query);
        let base = RemoteDocumentCache::get_all(tables, &keys);
        let documents = local_documents.merge_overlays_and_filter(tables, query, base);
        log::debug!(
            "index {} answered {} with {} documents",
            index.index_id,
            query.canonical_id(),
            documents.len()
        );
        Some(QueryEngineResult {
            documents,
            strategy: QueryStrategy::IndexLookup,
        })
    }

    fn perform_incremental(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> Option<QueryEngineResult> {
        if last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let tables = txn.tables();
        let previous: BTreeMap<DocumentKey, MutableDocument> = local_documents
            .get_documents(tables, remote_keys)
            .into_iter()
            .filter(|(_, document)| query.matches(document))
            .collect();

        if query.has_limit()
            && needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        let mut documents = previous;
        documents.extend(local_documents.get_documents_matching_collection_query(
            tables,
            query,
            last_limbo_free_snapshot_version,
        ));
        // Previously matching documents may have been changed by an overlay.
        documents.retain(|_, document| query.matches(document));
        Some(QueryEngineResult {
            documents,
            strategy: QueryStrategy::Incremental,
        })
    }

    fn perform_full_scan(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> QueryEngineResult {
        let tables = txn.tables();
        let documents_read = RemoteDocumentCache::collection_size(tables, query.path());
        let documents = local_documents.get_documents_matching_collection_query(
            tables,
            query,
            SnapshotVersion::min(),
        );
        self.maybe_create_index(txn, query, documents_read, documents.len());
        QueryEngineResult {
            documents,
            strategy: QueryStrategy::FullScan,
        }
    }

    fn maybe_create_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        documents_read: usize,
        result_size: usize,
    ) {
        let settings = &self.settings;
        if !settings.index_auto_creation_enabled
            || documents_read <= settings.min_collection_size_to_auto_create_index
        {
            return;
        }
        let threshold = settings.relative_index_read_cost_per_document * result_size as f64;
        if (documents_read as f64) > threshold {
            if let Some(index) = IndexManager::create_target_index(txn, query) {
                log::debug!(
                    "full scan of {} read {documents_read} documents for {result_size} results; created index {}",
                    query.path(),
                    index.index_id
                );
            }
        }
    }
}

/// True when a limited query can no longer be answered from its previous
/// result: a previous match dropped out, or the document at the edge of the
/// limit changed after the last consistent snapshot.
fn needs_refill(
    query: &Query,
    previous: &BTreeMap<DocumentKey, MutableDocument>,
    remote_keys: &BTreeSet<DocumentKey>,
    last_limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if previous.len() != remote_keys.len() {
        return true;
    }
    let mut sorted: Vec<&MutableDocument> = previous.values().collect();
    sorted.sort_by(|left, right| query.compare_documents(left, right));
    let edge = match query.limit_type() {
        LimitType::First => sorted.last(),
        LimitType::Last => sorted.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > last_limbo_free_snapshot_version
        }
        None => false,
    }
}
