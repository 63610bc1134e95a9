pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use self::core::{
    FirestoreClient, FirestoreSettings, ListenOptions, ListenerRegistration, PersistenceSettings,
    Query, ViewSnapshot,
};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
