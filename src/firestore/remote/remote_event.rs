use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetId, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Everything one consistent watch pass changed.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results must be discarded, with the purpose of
    /// the re-listen.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta inside a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn new(resume_token: Vec<u8>, current: bool) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !(self.added_documents.is_empty()
            && self.modified_documents.is_empty()
            && self.removed_documents.is_empty())
    }
}
