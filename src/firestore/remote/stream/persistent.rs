//! Lifecycle shared by the listen and write streams.
//!
//! A stream goes `Initial -> Starting -> Open` and ends in `Initial` after a
//! graceful close or `Error` after a failure. Starting from `Error` waits
//! out the exponential backoff first. Every callback runs as a job on the
//! [`AsyncQueue`]; a generation counter bumped on each close makes jobs
//! belonging to an older connection attempt no-ops.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::StreamHandle;
use crate::firestore::remote::network::NetworkLayer;
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }

    fn idle_timer(&self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(&self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamPhase {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
}

/// Receives the events of one [`PersistentStream`].
#[async_trait]
pub trait StreamEventHandler: Send + Sync + 'static {
    async fn on_open(&self);

    /// An error closes the stream as if the server had failed it.
    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    /// `None` after an idle close, the error otherwise.
    async fn on_close(&self, error: Option<FirestoreError>);
}

struct StreamState {
    phase: StreamPhase,
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

struct StreamInner<H> {
    kind: StreamKind,
    queue: AsyncQueue,
    network: NetworkLayer,
    handler: Arc<H>,
    state: Mutex<StreamState>,
}

pub struct PersistentStream<H> {
    inner: Arc<StreamInner<H>>,
}

impl<H> Clone for PersistentStream<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H> PersistentStream<H>
where
    H: StreamEventHandler,
{
    pub fn new(kind: StreamKind, queue: AsyncQueue, network: NetworkLayer, handler: Arc<H>) -> Self {
        let backoff = ExponentialBackoff::new(*network.backoff());
        Self {
            inner: Arc::new(StreamInner {
                kind,
                queue,
                network,
                handler,
                state: Mutex::new(StreamState {
                    phase: StreamPhase::Initial,
                    generation: 0,
                    handle: None,
                    backoff,
                    idle_timer: None,
                    backoff_timer: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    /// Starting, backing off or open.
    pub fn is_started(&self) -> bool {
        matches!(
            self.lock().phase,
            StreamPhase::Starting | StreamPhase::Backoff | StreamPhase::Open
        )
    }

    pub fn is_open(&self) -> bool {
        self.lock().phase == StreamPhase::Open
    }

    /// Opens the stream, after the backoff delay when the previous attempt
    /// failed. No-op while already started.
    pub fn start(&self) {
        let generation = {
            let mut state = self.lock();
            match state.phase {
                StreamPhase::Error => {
                    self.schedule_backoff(&mut state);
                    return;
                }
                StreamPhase::Initial => {}
                StreamPhase::Starting | StreamPhase::Open | StreamPhase::Backoff => return,
            }
            state.phase = StreamPhase::Starting;
            state.generation += 1;
            state.generation
        };

        let stream = self.clone();
        runtime::spawn_detached(async move {
            let result = stream.inner.network.open_stream(stream.inner.kind).await;
            let job = stream.clone();
            let enqueued = stream.inner.queue.enqueue(async move {
                job.on_connection_result(generation, result).await;
            });
            if let Err(err) = enqueued {
                log::debug!("{} stream open dropped: {err}", stream.inner.kind.label());
            }
        });
    }

    fn schedule_backoff(&self, state: &mut StreamState) {
        state.phase = StreamPhase::Backoff;
        let delay = state.backoff.next_delay();
        log::debug!("{} stream backing off for {delay:?}", self.inner.kind.label());
        let stream = self.clone();
        let timer = self
            .inner
            .queue
            .enqueue_after_delay(self.inner.kind.backoff_timer(), delay, move || async move {
                {
                    let mut state = stream.lock();
                    state.backoff_timer = None;
                    if state.phase != StreamPhase::Backoff {
                        return;
                    }
                    state.phase = StreamPhase::Initial;
                }
                stream.start();
            });
        state.backoff_timer = Some(timer);
    }

    async fn on_connection_result(&self, generation: u64, result: FirestoreResult<Arc<dyn StreamHandle>>) {
        if self.lock().generation != generation {
            if let Ok(handle) = result {
                let _ = handle.close().await;
            }
            return;
        }
        match result {
            Ok(handle) => {
                {
                    let mut state = self.lock();
                    state.phase = StreamPhase::Open;
                    state.handle = Some(Arc::clone(&handle));
                }
                log::debug!("{} stream open", self.inner.kind.label());
                self.spawn_reader(generation, handle);
                self.inner.handler.on_open().await;
            }
            Err(err) => {
                log::debug!("{} stream failed to open: {err}", self.inner.kind.label());
                self.close(StreamPhase::Error, Some(err)).await;
            }
        }
    }

    fn spawn_reader(&self, generation: u64, handle: Arc<dyn StreamHandle>) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            loop {
                let event = handle.next().await;
                if stream.lock().generation != generation {
                    return;
                }
                let (payload, terminal) = match event {
                    Some(Ok(payload)) => (Ok(payload), false),
                    Some(Err(err)) => (Err(err), true),
                    None => (Err(unavailable("stream closed by the server")), true),
                };
                let job = stream.clone();
                let enqueued = stream.inner.queue.enqueue(async move {
                    job.on_stream_event(generation, payload).await;
                });
                if enqueued.is_err() || terminal {
                    return;
                }
            }
        });
    }

    async fn on_stream_event(&self, generation: u64, event: FirestoreResult<Vec<u8>>) {
        if self.lock().generation != generation {
            return;
        }
        match event {
            Ok(payload) => {
                self.lock().backoff.reset();
                if let Err(err) = self.inner.handler.on_message(payload).await {
                    log::warn!("{} stream message rejected: {err}", self.inner.kind.label());
                    if self.lock().generation == generation {
                        self.close(StreamPhase::Error, Some(err)).await;
                    }
                }
            }
            Err(err) => {
                log::debug!("{} stream closed: {err}", self.inner.kind.label());
                self.close(StreamPhase::Error, Some(err)).await;
            }
        }
    }

    /// Tears the stream down, then reports the close to the handler.
    async fn close(&self, final_phase: StreamPhase, error: Option<FirestoreError>) {
        let handle = {
            let mut state = self.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = state.backoff_timer.take() {
                timer.cancel();
            }
            state.generation += 1;
            match &error {
                Some(err) if final_phase == StreamPhase::Error => match err.code {
                    FirestoreErrorCode::ResourceExhausted => {
                        log::warn!("{err}; using maximum backoff delay");
                        state.backoff.reset_to_max();
                    }
                    FirestoreErrorCode::Unauthenticated | FirestoreErrorCode::PermissionDenied => {
                        self.inner.network.invalidate_credentials();
                    }
                    _ => {}
                },
                _ => state.backoff.reset(),
            }
            state.phase = final_phase;
            state.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.close().await;
        }
        self.inner.handler.on_close(error).await;
    }

    /// Closes the stream without notifying the handler. The next start
    /// connects immediately.
    pub fn stop(&self) {
        let handle = {
            let mut state = self.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = state.backoff_timer.take() {
                timer.cancel();
            }
            state.generation += 1;
            state.backoff.reset();
            state.phase = StreamPhase::Initial;
            state.handle.take()
        };
        if let Some(handle) = handle {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
        }
    }

    /// After a failure the next start normally backs off; this skips that.
    pub fn inhibit_backoff(&self) {
        let mut state = self.lock();
        if state.phase == StreamPhase::Error {
            state.phase = StreamPhase::Initial;
        }
        state.backoff.reset();
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let handle = {
            let mut state = self.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(payload).await,
            None => Err(unavailable(format!("{} stream is not open", self.inner.kind.label()))),
        }
    }

    /// Schedules a graceful close unless more work arrives within the idle
    /// timeout.
    pub fn mark_idle(&self) {
        let mut state = self.lock();
        if state.phase != StreamPhase::Open || state.idle_timer.is_some() {
            return;
        }
        let stream = self.clone();
        let timer = self.inner.queue.enqueue_after_delay(
            self.inner.kind.idle_timer(),
            self.inner.network.idle_timeout(),
            move || async move {
                let open = {
                    let mut state = stream.lock();
                    state.idle_timer = None;
                    state.phase == StreamPhase::Open
                };
                if open {
                    log::debug!("closing idle {} stream", stream.inner.kind.label());
                    stream.close(StreamPhase::Initial, None).await;
                }
            },
        );
        state.idle_timer = Some(timer);
    }
}
