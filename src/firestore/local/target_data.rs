use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::model::SnapshotVersion;

pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch without a usable bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter failed to reconcile the count.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    pub snapshot_version: SnapshotVersion,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "crate::util::base64", default)]
    pub resume_token: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// New resume token at `snapshot_version`. Clears any expected count,
    /// which only applies to the token it was computed for.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Hands out target ids from one parity class so ids from different
/// generators never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids, continuing after `highest` when one has been used.
    pub fn for_target_cache(highest: TargetId) -> Self {
        let floor = highest.max(0);
        Self {
            next_id: floor - floor % 2 + 2,
        }
    }

    /// Odd ids, used for limbo resolution targets that are never persisted.
    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
