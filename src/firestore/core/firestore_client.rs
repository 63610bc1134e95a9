//! Application-facing client.
//!
//! [`FirestoreClient`] builds the local store, remote store and sync engine
//! from [`FirestoreSettings`] and runs every operation as a job on one
//! [`AsyncQueue`], so engine state is only ever touched by one job at a
//! time.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::event_manager::{ListenOptions, ListenerId, SnapshotCallback};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{
    PendingWrite, SyncEngine, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};
use crate::firestore::core::view::{View, ViewSnapshot};
use crate::firestore::error::{
    cancelled, unavailable, ErrorCategory, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::{
    FilePersistence, LocalStore, LruGarbageCollector, LruParams, LruResults, MemoryPersistence,
    Persistence, QueryEngineSettings,
};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation, User};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::{OnlineState, DEFAULT_ONLINE_STATE_TIMEOUT};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::platform::runtime::sleep;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// Delay before the first garbage collection after start.
const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
/// Delay between later garbage collections.
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PersistenceSettings {
    #[default]
    Memory,
    /// A JSON file guarded by a lock file. With `fallback_to_memory`, a
    /// store locked by another instance degrades to memory persistence.
    Durable {
        path: PathBuf,
        fallback_to_memory: bool,
    },
}

#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub persistence: PersistenceSettings,
    pub lru_params: LruParams,
    pub max_concurrent_limbo_resolutions: usize,
    pub query_engine: QueryEngineSettings,
    pub online_state_timeout: Duration,
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            persistence: PersistenceSettings::default(),
            lru_params: LruParams::default(),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            query_engine: QueryEngineSettings::default(),
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_lru_params(mut self, lru_params: LruParams) -> Self {
        self.lru_params = lru_params;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_query_engine(mut self, query_engine: QueryEngineSettings) -> Self {
        self.query_engine = query_engine;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }
}

fn open_persistence(settings: &PersistenceSettings) -> FirestoreResult<Arc<dyn Persistence>> {
    match settings {
        PersistenceSettings::Memory => Ok(Arc::new(MemoryPersistence::new())),
        PersistenceSettings::Durable {
            path,
            fallback_to_memory,
        } => match FilePersistence::open(path) {
            Ok(persistence) => Ok(Arc::new(persistence)),
            Err(err) if *fallback_to_memory && err.code == FirestoreErrorCode::PersistenceUnavailable => {
                log::warn!("falling back to memory persistence: {err}");
                Ok(Arc::new(MemoryPersistence::new()))
            }
            Err(err) => Err(err),
        },
    }
}

/// Runs LRU collection on the queue: once shortly after start, then
/// periodically.
struct LruScheduler {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    collector: LruGarbageCollector,
    task: Mutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    fn start(self: &Arc<Self>) {
        if self.collector.params().cache_size_collection_threshold.is_none() {
            log::debug!("garbage collection disabled");
            return;
        }
        self.schedule(INITIAL_GC_DELAY);
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let scheduler = Arc::downgrade(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::GarbageCollection, delay, move || async move {
                let Some(scheduler) = scheduler.upgrade() else {
                    return;
                };
                scheduler.run();
                scheduler.schedule(REGULAR_GC_DELAY);
            });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn run(&self) {
        match self.local_store.collect_garbage(&self.collector) {
            Ok(results) if results.did_run => log::debug!(
                "garbage collection removed {} targets and {} documents",
                results.targets_removed,
                results.documents_removed
            ),
            Ok(_) => {}
            Err(err) if err.code == FirestoreErrorCode::PersistenceUnavailable => {
                log::debug!("garbage collection skipped: {err}");
            }
            Err(err) => log::warn!("garbage collection failed: {err}"),
        }
    }

    fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.cancel();
        }
    }
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    queue: AsyncQueue,
    sync_engine: Weak<SyncEngine>,
    listener_id: ListenerId,
}

impl ListenerRegistration {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// Stops the listener. Succeeds silently once the client is terminated.
    pub async fn remove(self) -> FirestoreResult<()> {
        let Some(sync_engine) = self.sync_engine.upgrade() else {
            return Ok(());
        };
        if self.queue.is_shutting_down() {
            return Ok(());
        }
        let listener_id = self.listener_id;
        self.queue
            .enqueue_and_wait(async move { sync_engine.unlisten(listener_id).await })
            .await
    }
}

pub struct FirestoreClient {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    gc_scheduler: Arc<LruScheduler>,
}

impl FirestoreClient {
    /// Opens persistence, starts the remote store and schedules garbage
    /// collection. Must run inside a tokio runtime.
    pub async fn new(settings: FirestoreSettings, network: NetworkLayer) -> FirestoreResult<Self> {
        let persistence = open_persistence(&settings.persistence)?;
        Self::with_persistence(settings, network, persistence).await
    }

    /// Like [`FirestoreClient::new`] but runs on the given driver;
    /// `settings.persistence` is ignored.
    pub async fn with_persistence(
        settings: FirestoreSettings,
        network: NetworkLayer,
        persistence: Arc<dyn Persistence>,
    ) -> FirestoreResult<Self> {
        let user = network.auth_provider().current_user();
        let local_store = Arc::new(LocalStore::new(persistence, settings.query_engine, user.clone()));
        local_store.start()?;

        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            network.clone(),
            queue.clone(),
            settings.database_id.clone(),
            settings.online_state_timeout,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            user,
            settings.max_concurrent_limbo_resolutions,
        );

        let listener_queue = queue.clone();
        let listener_engine = Arc::downgrade(&sync_engine);
        network
            .auth_provider()
            .set_change_listener(Arc::new(move |user: User| {
                let Some(sync_engine) = listener_engine.upgrade() else {
                    return;
                };
                let queued = listener_queue.enqueue(async move {
                    if let Err(err) = sync_engine.remote_store().handle_credential_change(user).await {
                        log::warn!("credential change failed: {err}");
                    }
                });
                if let Err(err) = queued {
                    log::debug!("credential change ignored: {err}");
                }
            }));

        queue
            .enqueue_and_wait(async move { remote_store.start().await })
            .await?;

        let gc_scheduler = Arc::new(LruScheduler {
            queue: queue.clone(),
            local_store: Arc::clone(&local_store),
            collector: LruGarbageCollector::new(settings.lru_params),
            task: Mutex::new(None),
        });
        gc_scheduler.start();

        Ok(Self {
            queue,
            local_store,
            sync_engine,
            gc_scheduler,
        })
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    /// Runs a local-store operation on the queue. While the store reports
    /// `persistence-unavailable` the call waits with backoff and runs the
    /// operation again; termination ends the wait with `cancelled`.
    async fn run_local<F, Fut, T>(&self, label: &str, mut operation: F) -> FirestoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        loop {
            match self.queue.enqueue_and_wait(operation()).await {
                Err(err) if err.category() == ErrorCategory::PersistenceUnavailable => {
                    if self.queue.is_shutting_down() {
                        return Err(cancelled(format!("{label} cancelled by terminate")));
                    }
                    let delay = backoff.next_delay();
                    log::debug!("{label} paused for {delay:?}: {err}");
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    pub fn online_state(&self) -> OnlineState {
        self.sync_engine.remote_store().online_state()
    }

    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(callback);
        let listener_id = self
            .run_local("listen", || {
                let sync_engine = Arc::clone(&self.sync_engine);
                let query = query.clone();
                let callback = Arc::clone(&callback);
                async move { sync_engine.listen(query, options, callback).await }
            })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            sync_engine: Arc::downgrade(&self.sync_engine),
            listener_id,
        })
    }

    /// Applies `mutations` as one batch. The returned handle resolves once
    /// the backend acknowledged it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        self.run_local("write", || {
            let sync_engine = Arc::clone(&self.sync_engine);
            let mutations = mutations.clone();
            async move { sync_engine.write(mutations).await }
        })
        .await
    }

    /// Waits until every write issued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.sync_engine);
        let completion = self
            .queue
            .enqueue_and_wait(async move { sync_engine.register_pending_writes_task().await })
            .await?;
        completion.wait().await
    }

    /// The cached document, `None` when the cache knows it does not exist.
    pub async fn get_document_from_local_cache(
        &self,
        key: DocumentKey,
    ) -> FirestoreResult<Option<MutableDocument>> {
        self.run_local("cache read", || {
            let local_store = Arc::clone(&self.local_store);
            let key = key.clone();
            async move {
                let document = local_store.get_document(&key)?;
                if document.is_found_document() {
                    Ok(Some(document))
                } else if document.is_no_document() {
                    Ok(None)
                } else {
                    Err(unavailable(format!(
                        "Failed to get document {key} from cache; it may exist on the server"
                    )))
                }
            }
        })
        .await
    }

    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.run_local("cache query", || {
            let local_store = Arc::clone(&self.local_store);
            let query = query.clone();
            async move {
                let result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query.clone(), result.remote_keys);
                let changes = view.compute_doc_changes(&result.documents, None)?;
                view.apply_changes(changes, false, None, false)
                    .snapshot
                    .ok_or_else(|| unavailable("Failed to compute a snapshot from the cache"))
            }
        })
        .await
    }

    /// Listens until the backend delivered a consistent result. Fails with
    /// `unavailable` when the client is offline.
    pub async fn get_documents_from_server(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = async_channel::bounded(1);
        let registration = self
            .listen(
                query,
                ListenOptions::default()
                    .with_metadata_changes()
                    .wait_for_sync_when_online(),
                move |result| {
                    let _ = sender.try_send(result);
                },
            )
            .await?;
        let result = receiver
            .recv()
            .await
            .map_err(|_| cancelled("The listener was dropped before a result arrived"));
        registration.remove().await?;
        let snapshot = result??;
        if snapshot.from_cache {
            return Err(unavailable(
                "Failed to get documents from server; the client is offline",
            ));
        }
        Ok(snapshot)
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.sync_engine.remote_store().clone();
        self.queue
            .enqueue_and_wait(async move { remote_store.enable_network().await })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.sync_engine.remote_store().clone();
        self.queue
            .enqueue_and_wait(async move {
                remote_store.disable_network().await;
                Ok(())
            })
            .await
    }

    /// Restarts both streams, for example after the device switched networks.
    pub async fn handle_connectivity_change(&self) -> FirestoreResult<()> {
        let remote_store = self.sync_engine.remote_store().clone();
        self.queue
            .enqueue_and_wait(async move { remote_store.handle_connectivity_change().await })
            .await
    }

    /// Runs one collection pass now, honouring the configured threshold.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let local_store = Arc::clone(&self.local_store);
        let collector = self.gc_scheduler.collector.clone();
        self.queue
            .enqueue_and_wait(async move { local_store.collect_garbage(&collector) })
            .await
    }

    /// Shuts the client down. Later calls fail with `cancelled`; pending
    /// write handles resolve with `cancelled`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.gc_scheduler.stop();
        let sync_engine = Arc::clone(&self.sync_engine);
        let (sender, receiver) = async_channel::bounded(1);
        self.queue.enqueue_and_initiate_shutdown(async move {
            sync_engine.shutdown().await;
            let _ = sender.send(()).await;
        })?;
        // A second terminate finds the queue already shutting down and the
        // sender dropped.
        let _ = receiver.recv().await;
        Ok(())
    }
}
