use std::collections::BTreeSet;

use crate::firestore::local::persistence::{MutationQueueMetadata, PersistenceTransaction, Tables};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, User, BATCH_ID_UNKNOWN,
};

/// Pending writes of one user, ordered by batch id.
///
/// Batch ids come from the shared target globals so they are never reused
/// across users or after acknowledgement.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_key: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.to_key(),
        }
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    fn metadata(&self, tables: &Tables) -> MutationQueueMetadata {
        tables
            .mutation_queues
            .get(&self.user_key)
            .cloned()
            .unwrap_or_default()
    }

    fn user_batches<'t>(&self, tables: &'t Tables) -> impl Iterator<Item = &'t MutationBatch> + 't {
        tables
            .mutation_batches
            .range((self.user_key.clone(), BatchId::MIN)..=(self.user_key.clone(), BatchId::MAX))
            .map(|(_, batch)| batch)
    }

    pub fn is_empty(&self, tables: &Tables) -> bool {
        self.user_batches(tables).next().is_none()
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = txn.tables().target_globals.highest_batch_id.max(0) + 1;
        txn.update_target_globals(|globals| globals.highest_batch_id = batch_id);

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            txn.insert_member(
                Tables::document_mutations_mut,
                (self.user_key.clone(), key, batch_id),
            );
        }
        txn.put(
            Tables::mutation_batches_mut,
            (self.user_key.clone(), batch_id),
            batch.clone(),
        );
        batch
    }

    pub fn lookup_batch(&self, tables: &Tables, batch_id: BatchId) -> Option<MutationBatch> {
        tables
            .mutation_batches
            .get(&(self.user_key.clone(), batch_id))
            .cloned()
    }

    /// First batch with an id greater than `batch_id`.
    pub fn next_batch_after(&self, tables: &Tables, batch_id: BatchId) -> Option<MutationBatch> {
        self.user_batches(tables)
            .find(|batch| batch.batch_id > batch_id)
            .cloned()
    }

    pub fn highest_unacknowledged_batch_id(&self, tables: &Tables) -> BatchId {
        self.user_batches(tables)
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_batches(&self, tables: &Tables) -> Vec<MutationBatch> {
        self.user_batches(tables).cloned().collect()
    }

    /// Batches touching any of `keys`, in batch order.
    pub fn batches_affecting_keys(
        &self,
        tables: &Tables,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let start = (self.user_key.clone(), key.clone(), BatchId::MIN);
            let end = (self.user_key.clone(), key.clone(), BatchId::MAX);
            batch_ids.extend(
                tables
                    .document_mutations
                    .range(start..=end)
                    .map(|(_, _, batch_id)| *batch_id),
            );
        }
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_batch(tables, batch_id))
            .collect()
    }

    pub fn remove_batch(&self, txn: &mut PersistenceTransaction<'_>, batch: &MutationBatch) {
        txn.delete(
            Tables::mutation_batches_mut,
            &(self.user_key.clone(), batch.batch_id),
        );
        for key in batch.keys() {
            txn.remove_member(
                Tables::document_mutations_mut,
                &(self.user_key.clone(), key, batch.batch_id),
            );
        }
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
        stream_token: Vec<u8>,
    ) {
        let mut metadata = self.metadata(txn.tables());
        metadata.last_acknowledged_batch_id = batch_id;
        metadata.last_stream_token = stream_token;
        txn.put(Tables::mutation_queues_mut, self.user_key.clone(), metadata);
    }

    pub fn last_stream_token(&self, tables: &Tables) -> Vec<u8> {
        self.metadata(tables).last_stream_token
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>, stream_token: Vec<u8>) {
        let mut metadata = self.metadata(txn.tables());
        metadata.last_stream_token = stream_token;
        txn.put(Tables::mutation_queues_mut, self.user_key.clone(), metadata);
    }
}

/// True when any user's queue still references `key`.
pub fn has_pending_mutations(tables: &Tables, key: &DocumentKey) -> bool {
    tables
        .document_mutations
        .iter()
        .any(|(_, pending, _)| pending == key)
}
