use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};
use crate::firestore::remote::network::StreamCredentials;
use crate::firestore::remote::rpc_error::RpcStatus;
use crate::firestore::remote::watch_change::WatchDocument;
use crate::firestore::value::FirestoreValue;

pub mod streaming;

pub use streaming::StreamingDatastoreImpl;

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

/// One open bidirectional stream.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next inbound payload; `None` once the server closed the stream.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

/// Unary calls that bypass the persistent streams.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn commit(
        &self,
        mutations: Vec<Mutation>,
        credentials: StreamCredentials,
    ) -> FirestoreResult<CommitResponse>;

    /// Looks up `keys` on the server. Results come back in request order;
    /// keys the server does not have are returned as no-documents.
    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Vec<MutableDocument>>;
}

/// Request frame of a unary call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnaryRequest {
    Commit { writes: Vec<Mutation> },
    BatchGet { documents: Vec<DocumentKey> },
}

/// Server reply to a single write, shared by commits and the write stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireWriteResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform_results: Vec<FirestoreValue>,
    /// Set when this write alone was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RpcStatus>,
}

impl WireWriteResult {
    pub fn to_mutation_result(&self, commit_version: SnapshotVersion) -> FirestoreResult<MutationResult> {
        if let Some(status) = &self.status {
            return Err(status.to_error());
        }
        // Deletes carry no update time; they happen at the commit time.
        let version = self
            .update_time
            .map(SnapshotVersion::from_timestamp)
            .filter(|version| !version.is_min())
            .unwrap_or(commit_version);
        Ok(MutationResult {
            version,
            transform_results: self.transform_results.clone(),
        })
    }
}

pub fn mutation_results(
    write_results: &[WireWriteResult],
    commit_version: SnapshotVersion,
) -> Vec<FirestoreResult<MutationResult>> {
    write_results
        .iter()
        .map(|result| result.to_mutation_result(commit_version))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub commit_time: Timestamp,
    #[serde(default)]
    pub write_results: Vec<WireWriteResult>,
}

impl CommitResponse {
    pub fn commit_version(&self) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(self.commit_time)
    }

    pub fn mutation_results(&self) -> Vec<FirestoreResult<MutationResult>> {
        mutation_results(&self.write_results, self.commit_version())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetResponse {
    #[serde(default)]
    pub documents: Vec<BatchGetDocument>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<WatchDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<DocumentKey>,
    pub read_time: Timestamp,
}

impl BatchGetDocument {
    pub fn key(&self) -> Option<&DocumentKey> {
        self.found
            .as_ref()
            .map(|document| &document.key)
            .or(self.missing.as_ref())
    }

    pub fn to_mutable_document(&self) -> FirestoreResult<MutableDocument> {
        let read_time = SnapshotVersion::from_timestamp(self.read_time);
        let mut document = match (&self.found, &self.missing) {
            (Some(found), None) => found.to_mutable_document(),
            (None, Some(missing)) => MutableDocument::new_no_document(missing.clone(), read_time),
            _ => {
                return Err(internal_error(
                    "batchGet result must set exactly one of found and missing",
                ))
            }
        };
        document.set_read_time(read_time);
        Ok(document)
    }
}

impl BatchGetResponse {
    /// Orders the returned documents like `keys`.
    pub fn into_documents(self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>> {
        let mut by_key = std::collections::BTreeMap::new();
        for entry in &self.documents {
            let document = entry.to_mutable_document()?;
            by_key.insert(document.key().clone(), document);
        }
        keys.iter()
            .map(|key| {
                by_key.remove(key).ok_or_else(|| {
                    internal_error(format!("batchGet response is missing {}", key.path().canonical_string()))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::value::ObjectValue;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    #[test]
    fn write_result_falls_back_to_commit_version() {
        let results = mutation_results(
            &[
                WireWriteResult {
                    update_time: Some(Timestamp::new(4, 0)),
                    ..WireWriteResult::default()
                },
                WireWriteResult::default(),
                WireWriteResult {
                    status: Some(RpcStatus::new(9, "document changed")),
                    ..WireWriteResult::default()
                },
            ],
            version(5),
        );
        assert_eq!(results[0].as_ref().unwrap().version, version(4));
        assert_eq!(results[1].as_ref().unwrap().version, version(5));
        assert_eq!(
            results[2].as_ref().unwrap_err().code,
            FirestoreErrorCode::FailedPrecondition
        );
    }

    #[test]
    fn batch_get_results_follow_request_order() {
        let a = DocumentKey::from_string("rooms/a").unwrap();
        let b = DocumentKey::from_string("rooms/b").unwrap();
        let response = BatchGetResponse {
            documents: vec![
                BatchGetDocument {
                    found: None,
                    missing: Some(b.clone()),
                    read_time: Timestamp::new(7, 0),
                },
                BatchGetDocument {
                    found: Some(WatchDocument {
                        key: a.clone(),
                        fields: ObjectValue::empty(),
                        update_time: Timestamp::new(3, 0),
                        create_time: None,
                    }),
                    missing: None,
                    read_time: Timestamp::new(7, 0),
                },
            ],
        };
        let documents = response.into_documents(&[a.clone(), b.clone()]).unwrap();
        assert!(documents[0].is_found_document());
        assert_eq!(documents[0].read_time(), version(7));
        assert!(documents[1].is_no_document());
        assert_eq!(documents[1].version(), version(7));
    }

    #[test]
    fn unary_requests_are_tagged_by_method() {
        let request = UnaryRequest::BatchGet {
            documents: vec![DocumentKey::from_string("rooms/a").unwrap()],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, serde_json::json!({ "batchGet": { "documents": ["rooms/a"] } }));
    }
}
