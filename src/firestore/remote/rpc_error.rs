use serde::{Deserialize, Serialize};

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// Status payload attached to failed RPCs and rejected watch targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RpcStatus {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: status_code(error.code),
            message: Some(error.message().to_string()),
        }
    }

    pub fn to_error(&self) -> FirestoreError {
        map_grpc_status(self.code, self.message.clone())
    }
}

pub fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let message = message.unwrap_or_else(|| "remote call failed".to_string());
    FirestoreError::new(FirestoreErrorCode::from_status_code(code), message)
}

fn status_code(code: FirestoreErrorCode) -> i32 {
    match code {
        FirestoreErrorCode::Cancelled => 1,
        FirestoreErrorCode::Unknown => 2,
        FirestoreErrorCode::InvalidArgument => 3,
        FirestoreErrorCode::DeadlineExceeded => 4,
        FirestoreErrorCode::NotFound => 5,
        FirestoreErrorCode::AlreadyExists => 6,
        FirestoreErrorCode::PermissionDenied => 7,
        FirestoreErrorCode::ResourceExhausted => 8,
        FirestoreErrorCode::FailedPrecondition => 9,
        FirestoreErrorCode::Aborted => 10,
        FirestoreErrorCode::OutOfRange => 11,
        FirestoreErrorCode::Unimplemented => 12,
        FirestoreErrorCode::Internal => 13,
        FirestoreErrorCode::Unavailable => 14,
        FirestoreErrorCode::DataLoss => 15,
        FirestoreErrorCode::Unauthenticated => 16,
        FirestoreErrorCode::PersistenceUnavailable => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_numeric_status() {
        let err = map_grpc_status(7, Some("denied".into()));
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(err.message(), "denied");
    }

    #[test]
    fn status_survives_json() {
        let status = RpcStatus::new(14, "backend down");
        let json = serde_json::to_string(&status).unwrap();
        let decoded: RpcStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.to_error().code, FirestoreErrorCode::Unavailable);
    }
}
