//! Field indexes over the remote document cache.
//!
//! An index belongs to one collection group and lists the fields it orders
//! by: the equality-filter fields of the query it was built for, followed by
//! that query's order-by fields. Every remote document in the group with all
//! indexed fields present contributes one [`IndexEntry`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{FilterOperator, Query};
use crate::firestore::local::persistence::{PersistenceTransaction, Tables};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument};
use crate::firestore::value::FirestoreValue;

pub type IndexId = i32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIndex {
    pub index_id: IndexId,
    pub collection_group: String,
    pub fields: Vec<FieldPath>,
}

impl FieldIndex {
    fn values_for(&self, document: &MutableDocument) -> Option<Vec<FirestoreValue>> {
        if !document.is_found_document()
            || !document.key().has_collection_id(&self.collection_group)
        {
            return None;
        }
        self.fields
            .iter()
            .map(|field| document.field(field).cloned())
            .collect()
    }

    fn entry_for(&self, document: &MutableDocument) -> Option<IndexEntry> {
        self.values_for(document).map(|values| IndexEntry {
            index_id: self.index_id,
            values,
            key: document.key().clone(),
        })
    }
}

/// One row of an index. Entries order by index, then field values, then key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub index_id: IndexId,
    pub values: Vec<FirestoreValue>,
    pub key: DocumentKey,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IndexType {
    None,
    Full(FieldIndex),
}

/// Stateless accessor over the index tables.
pub struct IndexManager;

impl IndexManager {
    /// Fields an index must cover to answer `query`.
    pub fn index_fields_for(query: &Query) -> Vec<FieldPath> {
        let mut fields: Vec<FieldPath> = query
            .filters()
            .iter()
            .filter(|filter| filter.op() == FilterOperator::Equal && !filter.field().is_document_id())
            .map(|filter| filter.field().clone())
            .collect();
        fields.sort();
        fields.dedup();
        for order in query.normalized_order_by() {
            if !order.field().is_document_id() && !fields.contains(order.field()) {
                fields.push(order.field().clone());
            }
        }
        fields
    }

    pub fn field_indexes(tables: &Tables, collection_group: &str) -> Vec<FieldIndex> {
        tables
            .field_indexes
            .values()
            .filter(|index| index.collection_group == collection_group)
            .cloned()
            .collect()
    }

    pub fn index_type(tables: &Tables, query: &Query) -> IndexType {
        if query.is_document_query() || !Self::is_indexable(query) {
            return IndexType::None;
        }
        let Some(group) = query.collection_group() else {
            return IndexType::None;
        };
        let fields = Self::index_fields_for(query);
        if fields.is_empty() {
            return IndexType::None;
        }
        Self::field_indexes(tables, group)
            .into_iter()
            .find(|index| index.fields == fields)
            .map(IndexType::Full)
            .unwrap_or(IndexType::None)
    }

    /// Only equality and range filters narrow through an index; other
    /// operators always scan.
    fn is_indexable(query: &Query) -> bool {
        query.filters().iter().all(|filter| {
            !matches!(
                filter.op(),
                FilterOperator::ArrayContains
                    | FilterOperator::ArrayContainsAny
                    | FilterOperator::In
                    | FilterOperator::NotIn
                    | FilterOperator::NotEqual
            )
        })
    }

    /// Creates an index for `query` unless an equivalent one exists, then
    /// backfills it from the remote document cache.
    pub fn create_target_index(txn: &mut PersistenceTransaction<'_>, query: &Query) -> Option<FieldIndex> {
        let group = query.collection_group()?.to_string();
        if !Self::is_indexable(query) {
            return None;
        }
        let fields = Self::index_fields_for(query);
        if fields.is_empty() {
            return None;
        }
        let exists = Self::field_indexes(txn.tables(), &group)
            .iter()
            .any(|index| index.fields == fields);
        if exists {
            return None;
        }
        Some(Self::add_field_index(txn, group, fields))
    }

    pub fn add_field_index(
        txn: &mut PersistenceTransaction<'_>,
        collection_group: String,
        fields: Vec<FieldPath>,
    ) -> FieldIndex {
        let index_id = txn
            .tables()
            .field_indexes
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1);
        let index = FieldIndex {
            index_id,
            collection_group,
            fields,
        };
        txn.put(Tables::field_indexes_mut, index_id, index.clone());

        let entries: Vec<IndexEntry> = txn
            .tables()
            .remote_documents
            .values()
            .filter_map(|document| index.entry_for(document))
            .collect();
        log::debug!(
            "created index {} on {} with {} entries",
            index.index_id,
            index.collection_group,
            entries.len()
        );
        for entry in entries {
            txn.insert_member(Tables::index_entries_mut, entry);
        }
        index
    }

    /// Keeps every index of the document's collection group in step with a
    /// remote document write. `previous` is the row being replaced.
    pub fn update_entries(
        txn: &mut PersistenceTransaction<'_>,
        previous: Option<&MutableDocument>,
        document: Option<&MutableDocument>,
    ) {
        let Some(key) = document.or(previous).map(|doc| doc.key().clone()) else {
            return;
        };
        let Some(group) = key.path().segment(key.path().len().saturating_sub(2)) else {
            return;
        };
        for index in Self::field_indexes(txn.tables(), group) {
            let old = previous.and_then(|doc| index.entry_for(doc));
            let new = document.and_then(|doc| index.entry_for(doc));
            if old == new {
                continue;
            }
            if let Some(old) = old {
                txn.remove_member(Tables::index_entries_mut, &old);
            }
            if let Some(new) = new {
                txn.insert_member(Tables::index_entries_mut, new);
            }
        }
    }

    /// Keys whose entries match the equality prefix of `query` in `index`.
    /// The caller still evaluates the full query against each candidate.
    pub fn candidate_keys(tables: &Tables, index: &FieldIndex, query: &Query) -> BTreeSet<DocumentKey> {
        let mut prefix = Vec::new();
        for field in &index.fields {
            let equality = query
                .filters()
                .iter()
                .find(|filter| filter.op() == FilterOperator::Equal && filter.field() == field);
            match equality {
                Some(filter) => prefix.push(filter.value().clone()),
                None => break,
            }
        }
        let start = IndexEntry {
            index_id: index.index_id,
            values: prefix.clone(),
            key: DocumentKey::empty(),
        };
        tables
            .index_entries
            .range(start..)
            .take_while(|entry| {
                entry.index_id == index.index_id && entry.values.starts_with(&prefix)
            })
            .map(|entry| entry.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::query::{FieldFilter, OrderDirection};
    use crate::firestore::local::persistence::{MemoryPersistence, Persistence};
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::{MapValue, ObjectValue};

    fn doc(path: &str, size: i64, name: &str) -> MutableDocument {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("size".to_string(), FirestoreValue::from_integer(size));
        fields.insert("name".to_string(), FirestoreValue::from_string(name));
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::new(MapValue::new(fields)),
        )
    }

    fn size_query(size: i64) -> Query {
        Query::collection("rooms")
            .unwrap()
            .with_filter(
                FieldFilter::new(
                    FieldPath::from_dot_separated("size").unwrap(),
                    FilterOperator::Equal,
                    FirestoreValue::from_integer(size),
                )
                .unwrap(),
            )
            .order_by(
                FieldPath::from_dot_separated("name").unwrap(),
                OrderDirection::Ascending,
            )
    }

    #[test]
    fn index_fields_put_equalities_before_orders() {
        let fields = IndexManager::index_fields_for(&size_query(3));
        let names: Vec<String> = fields.iter().map(FieldPath::canonical_string).collect();
        assert_eq!(names, vec!["size", "name"]);
    }

    #[test]
    fn backfills_and_looks_up_by_prefix() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let keys = persistence
            .run_transaction("index", |txn| {
                for (path, size) in [("rooms/a", 3), ("rooms/b", 4), ("rooms/c", 3)] {
                    let document = doc(path, size, path);
                    txn.put(Tables::remote_documents_mut, document.key().clone(), document);
                }
                let query = size_query(3);
                let index = IndexManager::create_target_index(txn, &query).unwrap();
                assert_eq!(
                    IndexManager::index_type(txn.tables(), &query),
                    IndexType::Full(index.clone())
                );
                assert!(IndexManager::create_target_index(txn, &query).is_none());
                Ok(IndexManager::candidate_keys(txn.tables(), &index, &query))
            })
            .unwrap();
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/c"]);
    }

    #[test]
    fn entries_follow_document_updates() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        persistence
            .run_transaction("update", |txn| {
                let query = size_query(3);
                let index = IndexManager::create_target_index(txn, &query).unwrap();
                let before = doc("rooms/a", 3, "a");
                IndexManager::update_entries(txn, None, Some(&before));
                assert_eq!(IndexManager::candidate_keys(txn.tables(), &index, &query).len(), 1);

                let after = doc("rooms/a", 5, "a");
                IndexManager::update_entries(txn, Some(&before), Some(&after));
                assert!(IndexManager::candidate_keys(txn.tables(), &index, &query).is_empty());

                IndexManager::update_entries(txn, Some(&after), None);
                assert!(txn.tables().index_entries.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
