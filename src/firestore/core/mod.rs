pub mod async_queue;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod view;

pub use async_queue::{AsyncQueue, TimerId};
pub use event_manager::{ListenOptions, ListenerId};
pub use firestore_client::{FirestoreClient, FirestoreSettings, ListenerRegistration, PersistenceSettings};
pub use query::{FieldFilter, FilterOperator, LimitType, OrderDirection, Query};
pub use sync_engine::{PendingWrite, SyncEngine, WriteOutcome};
pub use target::Target;
pub use view::{ChangeType, DocumentSet, DocumentViewChange, ViewSnapshot};
