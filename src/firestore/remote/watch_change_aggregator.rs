use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::local::{TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};

/// Supplies what the aggregator needs to know about the targets it tracks.
pub trait TargetMetadataProvider {
    /// Keys the client currently considers part of the target's synced result.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// The target data of a target that is currently listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterOutcome {
    Success,
    Skipped,
    FalsePositive,
}

/// Accumulated changes for one target between two snapshots.
#[derive(Debug)]
struct TargetState {
    /// Add/remove requests sent for the target that the server has not
    /// acknowledged yet. Changes are ignored while this is non-zero.
    pending_responses: u32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // New targets always produce a change with the first snapshot.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::new(self.resume_token.clone(), self.current);
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual listen-stream messages into [`RemoteEvent`]s.
///
/// Messages are applied as they arrive. When the server reports a
/// consistent snapshot the remote store calls
/// [`WatchChangeAggregator::create_remote_event`] to take everything
/// accumulated so far.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each updated document was reported for, including removals.
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Targets each updated document currently belongs to.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change(&mut self, change: WatchChange, metadata: &dyn TargetMetadataProvider) {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(change, metadata),
            WatchChange::DocumentChange(change) => self.handle_document_change(change, metadata),
            WatchChange::DocumentDelete(delete) => self.handle_document_delete(delete, metadata),
            WatchChange::DocumentRemove(remove) => self.handle_document_remove(remove, metadata),
            WatchChange::Filter(filter) => self.handle_existence_filter(filter, metadata),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentChange, metadata: &dyn TargetMetadataProvider) {
        let document = change.document.to_mutable_document();
        for target_id in change.target_ids {
            self.add_document_to_target(target_id, document.clone(), metadata);
        }
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(target_id, document.key().clone(), Some(document.clone()), metadata);
        }
    }

    fn handle_document_delete(&mut self, delete: DocumentDelete, metadata: &dyn TargetMetadataProvider) {
        let version = delete
            .read_time
            .map(SnapshotVersion::from_timestamp)
            .unwrap_or_else(SnapshotVersion::min);
        let tombstone = MutableDocument::new_no_document(delete.key.clone(), version);
        for target_id in delete.removed_target_ids {
            self.remove_document_from_target(target_id, delete.key.clone(), Some(tombstone.clone()), metadata);
        }
    }

    fn handle_document_remove(&mut self, remove: DocumentRemove, metadata: &dyn TargetMetadataProvider) {
        for target_id in remove.removed_target_ids {
            self.remove_document_from_target(target_id, remove.key.clone(), None, metadata);
        }
    }

    /// Applies a target state change. Removals that carry an error cause are
    /// handled by the remote store before they reach the aggregator.
    pub fn handle_target_change(&mut self, change: WatchTargetChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in self.affected_targets(&change, metadata) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // An add acknowledgement means the server starts from
                        // scratch for this target.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(&self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        let mut targets: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, metadata))
            .collect();
        targets.sort_unstable();
        targets
    }

    /// Compares the server's document count with the local one and resets
    /// the target when they cannot be reconciled.
    pub fn handle_existence_filter(&mut self, filter: ExistenceFilterChange, metadata: &dyn TargetMetadataProvider) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if let Some(key) = target_data.target.document_key() {
            if expected_count == 0 {
                // The document is gone. Apply a delete now so other queries
                // cannot resurface it before the target catches up.
                let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
            } else if expected_count != 1 {
                log::warn!("single document existence filter with count {expected_count}");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == i64::from(expected_count) {
            return;
        }

        let outcome = self.apply_bloom_filter(&filter, current_count, metadata);
        if outcome != BloomFilterOutcome::Success {
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
            );
            self.reset_target(target_id, metadata);
            let purpose = if outcome == BloomFilterOutcome::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        current_count: i64,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterOutcome {
        let Some(payload) = filter.unchanged_names.as_ref() else {
            return BloomFilterOutcome::Skipped;
        };
        if payload.hash_count <= 0 || payload.bitmap.is_empty() {
            return BloomFilterOutcome::Skipped;
        }
        let bloom_filter = match BloomFilter::from_payload(payload) {
            Ok(bloom_filter) => bloom_filter,
            Err(err) => {
                log::warn!("ignoring malformed bloom filter: {err}");
                return BloomFilterOutcome::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterOutcome::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom_filter, filter.target_id, metadata);
        if i64::from(filter.count) != current_count - removed {
            BloomFilterOutcome::FalsePositive
        } else {
            BloomFilterOutcome::Success
        }
    }

    /// Removes every synced key the filter says is no longer present.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in metadata.remote_keys_for_target(target_id) {
            let name = metadata.database_id().document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Takes everything accumulated so far as one event at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort_unstable();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let document_key = target_data.target.document_key();
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);

            if let (true, Some(key)) = (current, document_key) {
                // A current document target that never produced its document
                // gets a synthesized delete so limbo resolution can finish.
                let reported = self
                    .pending_document_updates_by_target
                    .get(&key)
                    .map(|targets| targets.contains(&target_id))
                    .unwrap_or(false);
                if !reported && !self.target_contains_document(target_id, &key, metadata) {
                    let tombstone = MutableDocument::new_no_document(key.clone(), snapshot_version);
                    self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id, metadata) {
                    Some(target_data) => target_data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Notes that an add or remove request was sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed again before a snapshot was raised.
            state.remove_document_change(&key);
        }

        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .remove(&target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
        self.pending_document_updates_by_target
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Drops the target's accumulated changes and schedules removal of every
    /// document the client believes the target contains.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None, metadata);
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.remote_keys_for_target(target_id).contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata)
            .is_some()
    }

    fn target_data_for_active_target<'a>(
        &self,
        target_id: TargetId,
        metadata: &'a dyn TargetMetadataProvider,
    ) -> Option<&'a TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::Target;
    use crate::firestore::model::Timestamp;
    use crate::firestore::remote::bloom_filter::build_bloom_filter;
    use crate::firestore::remote::watch_change::WatchDocument;
    use crate::firestore::value::ObjectValue;

    struct Metadata {
        database_id: DatabaseId,
        targets: HashMap<TargetId, TargetData>,
        remote_keys: HashMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl Metadata {
        fn new() -> Self {
            Self {
                database_id: DatabaseId::default("p"),
                targets: HashMap::new(),
                remote_keys: HashMap::new(),
            }
        }

        fn with_query_target(mut self, target_id: TargetId, path: &str) -> Self {
            let target = Query::collection(path).unwrap().to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 0));
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, key: &DocumentKey) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(Target::for_document(key), target_id, TargetPurpose::LimboResolution, 0),
            );
            self
        }

        fn with_remote_keys(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }
    }

    impl TargetMetadataProvider for Metadata {
        fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
            self.targets.get(&target_id)
        }

        fn database_id(&self) -> &DatabaseId {
            &self.database_id
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    fn doc_change(path: &str, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            target_ids,
            removed_target_ids: Vec::new(),
            document: WatchDocument {
                key: key(path),
                fields: ObjectValue::empty(),
                update_time: Timestamp::new(1, 0),
                create_time: None,
            },
        })
    }

    fn target_change(state: TargetChangeState, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange::new(state, target_ids))
    }

    #[test]
    fn aggregates_added_modified_and_removed_documents() {
        let metadata = Metadata::new()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new();

        aggregator.handle_watch_change(doc_change("rooms/a", vec![2]), &metadata);
        aggregator.handle_watch_change(doc_change("rooms/b", vec![2]), &metadata);
        aggregator.handle_watch_change(
            WatchChange::DocumentDelete(DocumentDelete {
                key: key("rooms/c"),
                read_time: Some(Timestamp::new(2, 0)),
                removed_target_ids: vec![2],
            }),
            &metadata,
        );
        aggregator.handle_watch_change(
            target_change(TargetChangeState::Current, vec![2]),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(3), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/a")]));
        assert_eq!(change.modified_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(change.removed_documents, BTreeSet::from([key("rooms/c")]));
        assert!(event.document_updates[&key("rooms/c")].is_no_document());
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
        assert!(!event.resolved_limbo_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn ignores_changes_while_responses_are_pending() {
        let metadata = Metadata::new().with_query_target(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);

        aggregator.handle_watch_change(doc_change("rooms/a", vec![2]), &metadata);
        let event = aggregator.create_remote_event(version(1), &metadata);
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());

        aggregator.handle_watch_change(target_change(TargetChangeState::Add, vec![2]), &metadata);
        aggregator.handle_watch_change(doc_change("rooms/a", vec![2]), &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(event.target_changes[&2].added_documents.len(), 1);
    }

    #[test]
    fn document_added_and_removed_before_snapshot_cancels_out() {
        let metadata = Metadata::new().with_query_target(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(doc_change("rooms/a", vec![2]), &metadata);
        aggregator.handle_watch_change(
            WatchChange::DocumentRemove(DocumentRemove {
                key: key("rooms/a"),
                read_time: None,
                removed_target_ids: vec![2],
            }),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(1), &metadata);
        assert!(!event.target_changes[&2].has_document_changes());
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let limbo_key = key("rooms/ghost");
        let metadata = Metadata::new().with_limbo_target(1, &limbo_key);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(target_change(TargetChangeState::Current, vec![1]), &metadata);

        let event = aggregator.create_remote_event(version(4), &metadata);
        let tombstone = &event.document_updates[&limbo_key];
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), version(4));
        assert!(event.resolved_limbo_documents.contains(&limbo_key));
    }

    #[test]
    fn bloom_filter_removes_only_missing_documents() {
        let metadata = Metadata::new()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let names: Vec<String> = ["rooms/a", "rooms/c"]
            .iter()
            .map(|path| metadata.database_id.document_name(&key(path)))
            .collect();
        let bloom_filter = build_bloom_filter(names.iter().map(String::as_str), 1024, 10).unwrap();
        assert!(!bloom_filter.might_contain(&metadata.database_id.document_name(&key("rooms/b"))));

        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            WatchChange::Filter(ExistenceFilterChange {
                target_id: 2,
                count: 2,
                unchanged_names: Some(bloom_filter.to_payload()),
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(5), &metadata);
        assert!(event.target_mismatches.is_empty());
        assert_eq!(event.target_changes[&2].removed_documents, BTreeSet::from([key("rooms/b")]));
    }

    #[test]
    fn count_mismatch_without_bloom_filter_resets_target() {
        let metadata = Metadata::new()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            WatchChange::Filter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(5), &metadata);
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn bloom_filter_that_cannot_reconcile_count_marks_false_positive() {
        let metadata = Metadata::new()
            .with_query_target(2, "rooms")
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        // Every key appears present so nothing is removed.
        let saturated = BloomFilter::new(vec![0xff; 8], 0, 3).unwrap();
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            WatchChange::Filter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(saturated.to_payload()),
            }),
            &metadata,
        );

        let event = aggregator.create_remote_event(version(5), &metadata);
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatchBloom);
    }

    #[test]
    fn zero_count_on_document_target_deletes_document() {
        let doc_key = key("rooms/a");
        let metadata = Metadata::new().with_limbo_target(1, &doc_key);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            WatchChange::Filter(ExistenceFilterChange {
                target_id: 1,
                count: 0,
                unchanged_names: None,
            }),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.document_updates[&doc_key].is_no_document());
        assert!(event.target_mismatches.is_empty());
    }
}
