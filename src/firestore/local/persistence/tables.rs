use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::local::index_manager::{FieldIndex, IndexEntry};
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData, TargetId};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, MutationBatch, Overlay, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};

pub type TableRef<K, V> = fn(&mut Tables) -> &mut BTreeMap<K, V>;
pub type SetRef<T> = fn(&mut Tables) -> &mut BTreeSet<T>;

/// Counters shared by every target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGlobals {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub highest_batch_id: BatchId,
}

impl Default for TargetGlobals {
    fn default() -> Self {
        Self {
            highest_target_id: 0,
            highest_listen_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_batch_id: BATCH_ID_UNKNOWN,
        }
    }
}

/// Per-user write-pipeline state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueueMetadata {
    pub last_acknowledged_batch_id: BatchId,
    #[serde(with = "crate::util::base64", default)]
    pub last_stream_token: Vec<u8>,
}

impl Default for MutationQueueMetadata {
    fn default() -> Self {
        Self {
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub id: String,
    pub version: u32,
    pub create_time: SnapshotVersion,
    pub total_documents: u32,
    pub total_bytes: u64,
}

/// Every logical table held by a persistence driver.
///
/// Keys are plain values; rows reference each other by document key,
/// target id or batch id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tables {
    pub remote_documents: BTreeMap<DocumentKey, MutableDocument>,
    pub document_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
    pub target_documents: BTreeSet<(TargetId, DocumentKey)>,
    pub targets: BTreeMap<TargetId, TargetData>,
    pub target_globals: TargetGlobals,
    pub mutation_queues: BTreeMap<String, MutationQueueMetadata>,
    #[serde(with = "entries")]
    pub mutation_batches: BTreeMap<(String, BatchId), MutationBatch>,
    pub document_mutations: BTreeSet<(String, DocumentKey, BatchId)>,
    #[serde(with = "entries")]
    pub overlays: BTreeMap<(String, DocumentKey), Overlay>,
    pub bundles: BTreeMap<String, BundleMetadata>,
    pub field_indexes: BTreeMap<i32, FieldIndex>,
    pub index_entries: BTreeSet<IndexEntry>,
}

impl Tables {
    pub fn remote_documents_mut(&mut self) -> &mut BTreeMap<DocumentKey, MutableDocument> {
        &mut self.remote_documents
    }

    pub fn document_sequence_numbers_mut(
        &mut self,
    ) -> &mut BTreeMap<DocumentKey, ListenSequenceNumber> {
        &mut self.document_sequence_numbers
    }

    pub fn target_documents_mut(&mut self) -> &mut BTreeSet<(TargetId, DocumentKey)> {
        &mut self.target_documents
    }

    pub fn targets_mut(&mut self) -> &mut BTreeMap<TargetId, TargetData> {
        &mut self.targets
    }

    pub fn mutation_queues_mut(&mut self) -> &mut BTreeMap<String, MutationQueueMetadata> {
        &mut self.mutation_queues
    }

    pub fn mutation_batches_mut(&mut self) -> &mut BTreeMap<(String, BatchId), MutationBatch> {
        &mut self.mutation_batches
    }

    pub fn document_mutations_mut(&mut self) -> &mut BTreeSet<(String, DocumentKey, BatchId)> {
        &mut self.document_mutations
    }

    pub fn overlays_mut(&mut self) -> &mut BTreeMap<(String, DocumentKey), Overlay> {
        &mut self.overlays
    }

    pub fn bundles_mut(&mut self) -> &mut BTreeMap<String, BundleMetadata> {
        &mut self.bundles
    }

    pub fn field_indexes_mut(&mut self) -> &mut BTreeMap<i32, FieldIndex> {
        &mut self.field_indexes
    }

    pub fn index_entries_mut(&mut self) -> &mut BTreeSet<IndexEntry> {
        &mut self.index_entries
    }
}

/// Serializes maps with non-string keys as a list of `[key, value]` pairs.
mod entries {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let entries: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{Mutation, Timestamp};

    #[test]
    fn tables_survive_json() {
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let mut tables = Tables::default();
        tables.overlays.insert(
            ("alice".to_string(), key.clone()),
            Overlay::new(3, Mutation::delete(key.clone())),
        );
        tables.mutation_batches.insert(
            ("alice".to_string(), 3),
            MutationBatch::new(3, Timestamp::new(1, 0), Vec::new(), vec![Mutation::delete(key.clone())]),
        );
        tables.target_documents.insert((2, key.clone()));
        tables.document_sequence_numbers.insert(key.clone(), 7);

        let json = serde_json::to_string(&tables).unwrap();
        let back: Tables = serde_json::from_str(&json).unwrap();
        assert_eq!(back.overlays, tables.overlays);
        assert_eq!(back.mutation_batches, tables.mutation_batches);
        assert_eq!(back.target_documents, tables.target_documents);
        assert_eq!(back.document_sequence_numbers.get(&key), Some(&7));
    }
}
