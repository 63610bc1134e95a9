pub mod index_manager;
pub mod local_documents;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod overlay;
pub mod persistence;
pub mod query_engine;
pub mod remote_document_cache;
pub mod target_data;

#[doc(inline)]
pub use index_manager::{FieldIndex, IndexEntry, IndexManager, IndexType};
#[doc(inline)]
pub use local_documents::LocalDocumentsView;
#[doc(inline)]
pub use local_store::{DocumentMap, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
#[doc(inline)]
pub use mutation_queue::MutationQueue;
#[doc(inline)]
pub use overlay::DocumentOverlayCache;
#[doc(inline)]
pub use persistence::{FilePersistence, MemoryPersistence, Persistence, PersistenceTransaction};
#[doc(inline)]
pub use query_engine::{QueryEngine, QueryEngineSettings, QueryStrategy};
#[doc(inline)]
pub use target_data::{ListenSequenceNumber, TargetData, TargetId, TargetIdGenerator, TargetPurpose};
