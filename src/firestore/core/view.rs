//! Client-side view of one query's results.
//!
//! A [`View`] holds the documents a query currently shows together with the
//! keys the server has confirmed for its target. Feeding it document changes
//! produces [`ViewSnapshot`]s and reports which documents entered or left
//! limbo: shown locally but not confirmed by the server.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::DocumentMap;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::TargetChange;

/// Documents in query order.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Arc<Query>,
    documents: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<DocumentKey>,
}

impl DocumentSet {
    pub fn new(query: Arc<Query>) -> Self {
        Self {
            query,
            documents: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.documents.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first().and_then(|key| self.documents.get(key))
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last().and_then(|key| self.documents.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> + '_ {
        self.sorted.iter().filter_map(|key| self.documents.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.sorted.iter()
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let position = self.sorted.partition_point(|key| {
            self.documents
                .get(key)
                .map(|existing| self.query.compare_documents(existing, &document) == Ordering::Less)
                .unwrap_or(false)
        });
        self.sorted.insert(position, document.key().clone());
        self.documents.insert(document.key().clone(), document);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let removed = self.documents.remove(key)?;
        self.sorted.retain(|existing| existing != key);
        Some(removed)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted && self.documents == other.documents
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    fn sort_order(&self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

/// Per-key changes of one view computation, merged so that each key is
/// reported once.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        use ChangeType::*;

        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                return Err(internal_error(format!(
                    "unsupported change {new_type:?} after {old_type:?} for {key}"
                )))
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Immutable result of a query at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot in which every document is reported as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_documents = DocumentSet::new(Arc::new(query.clone()));
        Self {
            query,
            documents,
            old_documents,
            changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Intermediate result of [`View::compute_doc_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A limited query lost documents at its edge; the local store must be
    /// queried again to find the replacements.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

pub struct View {
    query: Arc<Query>,
    current: bool,
    document_set: DocumentSet,
    sync_state: Option<SyncState>,
    limbo_documents: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let query = Arc::new(query);
        Self {
            document_set: DocumentSet::new(Arc::clone(&query)),
            query,
            current: false,
            sync_state: None,
            limbo_documents: BTreeSet::new(),
            synced_documents,
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Works out how `changed` affects the view without applying anything.
    /// Pass the previous result to continue a computation after a refill.
    pub fn compute_doc_changes(
        &self,
        changed: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::default(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let full = self.query.limit().map(|limit| old_document_set.len() == limit as usize) == Some(true);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if full => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if full => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changed {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc
                .map(|doc| self.mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            let new_doc_has_pending_mutations = new_doc
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            })?;
                            change_applied = true;
                            let past_last = last_doc_in_limit.as_ref().is_some_and(|last| {
                                self.query.compare_documents(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().is_some_and(|first| {
                                self.query.compare_documents(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved outside the limit; the
                                // next document may be one we do not have.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        })?;
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    })?;
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    })?;
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                })?;
            }
        }

        Ok(ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        })
    }

    /// Applies computed changes and the target's server state. Returns a
    /// snapshot only when something observable changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_order()
                .cmp(&right.change_type.sort_order())
                .then_with(|| self.query.compare_documents(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: (*self.query).clone(),
            documents: doc_changes.document_set,
            old_documents,
            changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change
                .map(|change| !change.resume_token.is_empty())
                .unwrap_or(false),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// An offline client can no longer claim to be in sync.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::default(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not synced");
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes explain why the document is shown.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();
        let old_limbo = std::mem::replace(&mut self.limbo_documents, new_limbo);

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// A local write was acknowledged but the watch stream has not delivered
/// the committed version yet. Keeping the old document avoids flickering
/// back to the pre-write state.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::OrderDirection;
    use crate::firestore::model::{FieldPath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn doc(path: &str, order: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("order").unwrap(),
            FirestoreValue::from_integer(order),
        );
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
            data,
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn changes_of(documents: &[MutableDocument]) -> DocumentMap {
        documents
            .iter()
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    fn ordered_query() -> Query {
        Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("order").unwrap(), OrderDirection::Ascending)
    }

    fn apply(view: &mut View, documents: &[MutableDocument], target_change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&changes_of(documents), None).unwrap();
        view.apply_changes(changes, true, target_change, false)
    }

    #[test]
    fn initial_documents_are_added_in_query_order() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        let change = apply(&mut view, &[doc("rooms/b", 2), doc("rooms/a", 3), doc("rooms/c", 1)], None);
        let snapshot = change.snapshot.expect("snapshot");
        let keys: Vec<String> = snapshot
            .documents
            .iter()
            .map(|document| document.key().to_string())
            .collect();
        assert_eq!(keys, vec!["rooms/c", "rooms/b", "rooms/a"]);
        assert!(snapshot.changes.iter().all(|change| change.change_type == ChangeType::Added));
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn change_set_merges_consecutive_changes() {
        let mut set = DocumentChangeSet::default();
        set.track(DocumentViewChange {
            change_type: ChangeType::Added,
            document: doc("rooms/a", 1),
        })
        .unwrap();
        set.track(DocumentViewChange {
            change_type: ChangeType::Modified,
            document: doc("rooms/a", 2),
        })
        .unwrap();
        assert_eq!(set.changes()[0].change_type, ChangeType::Added);
        assert_eq!(set.changes()[0].document, doc("rooms/a", 2));

        set.track(DocumentViewChange {
            change_type: ChangeType::Removed,
            document: doc("rooms/a", 2),
        })
        .unwrap();
        assert!(set.changes().is_empty());

        set.track(DocumentViewChange {
            change_type: ChangeType::Removed,
            document: doc("rooms/b", 1),
        })
        .unwrap();
        set.track(DocumentViewChange {
            change_type: ChangeType::Added,
            document: doc("rooms/b", 4),
        })
        .unwrap();
        assert_eq!(set.changes()[0].change_type, ChangeType::Modified);

        let err = set
            .track(DocumentViewChange {
                change_type: ChangeType::Added,
                document: doc("rooms/b", 5),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Internal);
    }

    #[test]
    fn limited_query_requests_refill_when_a_document_leaves() {
        let query = ordered_query().limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)], None);
        assert_eq!(view.document_set.len(), 2);

        let mut deleted = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_timestamp(Timestamp::new(2, 0)));
        deleted.set_read_time(SnapshotVersion::from_timestamp(Timestamp::new(2, 0)));
        let changes = view.compute_doc_changes(&changes_of(&[deleted]), None).unwrap();
        assert!(changes.needs_refill);

        let refill = view
            .compute_doc_changes(&changes_of(&[doc("rooms/b", 2), doc("rooms/c", 3)]), Some(changes))
            .unwrap();
        let keys: Vec<&DocumentKey> = refill.document_set.keys().collect();
        assert_eq!(keys, vec![&key("rooms/b"), &key("rooms/c")]);
    }

    #[test]
    fn unsynced_documents_go_to_limbo_once_current() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);

        let mut target_change = TargetChange::new(vec![1], true);
        target_change.added_documents.insert(key("rooms/a"));
        let change = apply(&mut view, &[], Some(&target_change));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.is_none());
        assert_eq!(view.limbo_documents().len(), 1);

        let mut resolved = TargetChange::new(vec![2], true);
        resolved.removed_documents.insert(key("rooms/b"));
        let gone = MutableDocument::new_no_document(key("rooms/b"), SnapshotVersion::from_timestamp(Timestamp::new(3, 0)));
        let change = apply(&mut view, &[gone], Some(&resolved));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = change.snapshot.expect("snapshot");
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.changes.len(), 1);
        assert_eq!(snapshot.changes[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn going_offline_marks_a_current_view_from_cache() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        let mut target_change = TargetChange::new(vec![1], true);
        target_change.added_documents.insert(key("rooms/a"));
        let change = apply(&mut view, &[doc("rooms/a", 1)], Some(&target_change));
        assert!(!change.snapshot.unwrap().from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = offline.snapshot.expect("snapshot");
        assert!(snapshot.from_cache);
        assert!(snapshot.changes.is_empty());
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }

    #[test]
    fn pending_write_flip_is_a_metadata_change() {
        let mut view = View::new(ordered_query(), BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        apply(&mut view, &[local], None);
        assert!(view.mutated_keys.contains(&key("rooms/a")));

        let change = apply(&mut view, &[doc("rooms/a", 1)], None);
        let snapshot = change.snapshot.expect("snapshot");
        assert_eq!(snapshot.changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }
}
