use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Batch id used before any batch has been assigned.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written together by one local write call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    #[serde(default)]
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Replays base mutations, then the batch's own, onto `document`.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        let key = document.key().clone();
        for mutation in self
            .base_mutations
            .iter()
            .chain(self.mutations.iter())
            .filter(|mutation| mutation.key() == &key)
        {
            mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
        }
        mask
    }

    /// Applies acknowledged results. Mutations the backend rejected for this
    /// document are skipped.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self.mutations.iter().zip(batch_result.results.iter()) {
            if mutation.key() != document.key() {
                continue;
            }
            match result {
                Ok(result) => mutation.apply_to_remote_document(document, result),
                Err(err) => {
                    log::debug!(
                        "skipping rejected mutation for {} in batch {}: {err}",
                        document.key(),
                        self.batch_id
                    );
                }
            }
        }
    }
}

/// Backend acknowledgement of a [`MutationBatch`].
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub results: Vec<FirestoreResult<MutationResult>>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        results: Vec<FirestoreResult<MutationResult>>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != results.len() {
            return Err(internal_error(format!(
                "Batch {} has {} mutations but {} results",
                batch.batch_id,
                batch.mutations.len(),
                results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(results.iter())
            .map(|(mutation, result)| {
                let version = match result {
                    Ok(result) => result.version,
                    Err(_) => commit_version,
                };
                (mutation.key().clone(), version)
            })
            .collect();
        Ok(Self {
            batch,
            commit_version,
            results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::failed_precondition;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> ObjectValue {
        let mut object = ObjectValue::empty();
        object.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        object
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::now(), Vec::new(), vec![Mutation::delete(key("a/b"))]);
        assert!(MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new()).is_err());
    }

    #[test]
    fn local_view_applies_only_mutations_for_the_document() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("a/one"), data("x", 1)),
                Mutation::set(key("a/two"), data("x", 2)),
                Mutation::delete(key("a/one")),
                Mutation::set(key("a/one"), data("x", 3)),
            ],
        );
        let mut one = MutableDocument::new_invalid(key("a/one"));
        batch.apply_to_local_view(&mut one, None);
        assert!(one.is_found_document());
        assert!(one.has_local_mutations());
        assert_eq!(
            one.field(&FieldPath::from_dot_separated("x").unwrap()),
            Some(&FirestoreValue::from_integer(3))
        );
    }

    #[test]
    fn rejected_mutation_only_skips_its_document() {
        let version = SnapshotVersion::from_timestamp(Timestamp::new(10, 0));
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("a/one"), data("x", 1)),
                Mutation::set(key("a/two"), data("x", 2)),
            ],
        );
        let result = MutationBatchResult::from(
            batch.clone(),
            version,
            vec![Err(failed_precondition("missing")), Ok(MutationResult::new(version))],
            Vec::new(),
        )
        .unwrap();

        let mut one = MutableDocument::new_invalid(key("a/one"));
        batch.apply_to_remote_document(&mut one, &result);
        assert!(!one.is_valid_document());

        let mut two = MutableDocument::new_invalid(key("a/two"));
        batch.apply_to_remote_document(&mut two, &result);
        assert!(two.is_found_document());
        assert!(two.has_committed_mutations());
    }
}
