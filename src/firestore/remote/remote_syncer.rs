use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetId;
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, User};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// What the remote store reports back to the sync engine.
///
/// Every call is made from a job on the async queue, with no remote store
/// state locked, so implementations may call back into the remote store.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent watch snapshot.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The server rejected a listen target; it is no longer watched.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The batch failed with a permanent error and will not be retried.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the views of `target_id` consider synced with the server.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn handle_online_state_change(&self, state: OnlineState);

    /// Switches local state to `user`. Runs while the network is disabled.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;
}
