//! Messages exchanged on the listen stream.
//!
//! Frames are JSON objects with a single key naming the message kind, for
//! example `{"addTarget": {...}}` or `{"documentChange": {...}}`. Byte
//! tokens and bloom-filter bitmaps travel as base64 strings.

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::TargetId;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::remote::rpc_error::RpcStatus;
use crate::firestore::value::ObjectValue;

fn is_empty_token(token: &[u8]) -> bool {
    token.is_empty()
}

/// Client to server listen frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenRequest {
    AddTarget(WatchTarget),
    RemoveTarget(TargetId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTarget {
    pub target_id: TargetId,
    pub query: Target,
    #[serde(
        default,
        with = "crate::util::base64",
        skip_serializing_if = "is_empty_token"
    )]
    pub resume_token: Vec<u8>,
    /// Resume point when no token is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<Timestamp>,
    /// Number of documents the client believes match when resuming, so the
    /// server can send an existence filter instead of the full result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<i32>,
}

/// Server to client listen frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    Filter(ExistenceFilterChange),
}

impl WatchChange {
    pub fn decode(payload: &[u8]) -> FirestoreResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("Failed to decode listen response: {err}")))
    }

    pub fn encode(&self) -> FirestoreResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| internal_error(format!("Failed to encode listen response: {err}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTargetChange {
    #[serde(rename = "targetChangeType")]
    pub state: TargetChangeState,
    /// Empty means the change applies to every active target.
    #[serde(default)]
    pub target_ids: Vec<TargetId>,
    #[serde(
        default,
        with = "crate::util::base64",
        skip_serializing_if = "is_empty_token"
    )]
    pub resume_token: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<RpcStatus>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: Timestamp) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_cause(mut self, cause: RpcStatus) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document as sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchDocument {
    #[serde(rename = "name")]
    pub key: DocumentKey,
    #[serde(default)]
    pub fields: ObjectValue,
    pub update_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<Timestamp>,
}

impl WatchDocument {
    pub fn to_mutable_document(&self) -> MutableDocument {
        let mut document = MutableDocument::new_found(
            self.key.clone(),
            SnapshotVersion::from_timestamp(self.update_time),
            self.fields.clone(),
        );
        if let Some(create_time) = self.create_time {
            document.set_create_time(SnapshotVersion::from_timestamp(create_time));
        }
        document
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    #[serde(default)]
    pub target_ids: Vec<TargetId>,
    #[serde(default)]
    pub removed_target_ids: Vec<TargetId>,
    pub document: WatchDocument,
}

/// The document was deleted. Carries the commit time of the delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDelete {
    #[serde(rename = "document")]
    pub key: DocumentKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<Timestamp>,
    #[serde(default)]
    pub removed_target_ids: Vec<TargetId>,
}

/// The document no longer matches the listed targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRemove {
    #[serde(rename = "document")]
    pub key: DocumentKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<Timestamp>,
    #[serde(default)]
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Bloom filter over the fully qualified names of the documents that still
/// match a target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomFilterPayload {
    #[serde(default, with = "crate::util::base64")]
    pub bitmap: Vec<u8>,
    #[serde(default)]
    pub padding: i32,
    #[serde(default)]
    pub hash_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use serde_json::json;

    #[test]
    fn decodes_target_change_frames() {
        let payload = json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [2],
                "resumeToken": "AQID",
                "readTime": "1970-01-01T00:00:05Z"
            }
        });
        let change = WatchChange::decode(payload.to_string().as_bytes()).unwrap();
        let WatchChange::TargetChange(change) = change else {
            panic!("unexpected change {change:?}");
        };
        assert_eq!(change.state, TargetChangeState::Current);
        assert_eq!(change.target_ids, vec![2]);
        assert_eq!(change.resume_token, vec![1, 2, 3]);
        assert_eq!(change.read_time, Some(Timestamp::new(5, 0)));
    }

    #[test]
    fn add_target_frame_omits_empty_token() {
        let request = ListenRequest::AddTarget(WatchTarget {
            target_id: 2,
            query: Query::collection("rooms").unwrap().to_target(),
            resume_token: Vec::new(),
            read_time: None,
            expected_count: None,
        });
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["addTarget"]["targetId"], json!(2));
        assert!(value["addTarget"].get("resumeToken").is_none());

        let remove = serde_json::to_value(ListenRequest::RemoveTarget(2)).unwrap();
        assert_eq!(remove, json!({ "removeTarget": 2 }));
    }

    #[test]
    fn watch_document_converts_to_found_document() {
        let document = WatchDocument {
            key: DocumentKey::from_string("rooms/a").unwrap(),
            fields: ObjectValue::empty(),
            update_time: Timestamp::new(3, 0),
            create_time: Some(Timestamp::new(1, 0)),
        };
        let converted = document.to_mutable_document();
        assert!(converted.is_found_document());
        assert_eq!(converted.version(), SnapshotVersion::from_timestamp(Timestamp::new(3, 0)));
        assert_eq!(converted.create_time(), SnapshotVersion::from_timestamp(Timestamp::new(1, 0)));
    }
}
