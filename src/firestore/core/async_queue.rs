//! The serialized executor every piece of client state is mutated on.
//!
//! Operations are boxed futures that run one at a time, in the order they
//! were enqueued. Delayed operations sleep off the queue and enqueue their
//! body when the timer fires unless they were cancelled first. Retryable
//! operations run in order on a separate list so a failing operation backs
//! off without holding up unrelated work.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime::{sleep, spawn_detached};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

pub type QueueOperation = BoxFuture<'static, ()>;

type DelayedBody = Box<dyn FnOnce() -> QueueOperation + Send>;
type RetryableBody = Box<dyn FnMut() -> BoxFuture<'static, FirestoreResult<()>> + Send>;

/// Well-known delayed operations, so tests and shutdown can find them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    GarbageCollection,
    RetryTransaction,
}

struct DelayedEntry {
    timer_id: TimerId,
    body: DelayedBody,
}

#[derive(Default)]
struct QueueState {
    shutting_down: bool,
    next_delayed_id: u64,
    delayed: BTreeMap<u64, DelayedEntry>,
    retryable: VecDeque<RetryableBody>,
    retry_running: bool,
}

struct QueueInner {
    sender: Sender<QueueOperation>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        spawn_detached(run_operations(receiver));
        Self {
            inner: Arc::new(QueueInner {
                sender,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    fn push(&self, operation: QueueOperation) -> FirestoreResult<()> {
        self.inner
            .sender
            .try_send(operation)
            .map_err(|_| cancelled("The async queue is no longer running"))
    }

    /// Adds `operation` to the end of the queue. Fails with `cancelled`
    /// once shutdown has started.
    pub fn enqueue<F>(&self, operation: F) -> FirestoreResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(cancelled("The client has already been terminated"));
        }
        self.push(operation.boxed())
    }

    /// Enqueues `operation` and waits for its output.
    ///
    /// Must not be awaited from inside a queued operation: the caller would
    /// wait on work queued behind itself.
    pub async fn enqueue_and_wait<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = async_channel::bounded(1);
        self.enqueue(async move {
            let _ = sender.send(operation.await).await;
        })?;
        receiver
            .recv()
            .await
            .map_err(|_| cancelled("The queued operation was dropped"))?
    }

    /// Runs `operation` as the last operation of the queue. Later enqueues
    /// fail and pending delayed operations never fire.
    pub fn enqueue_and_initiate_shutdown<F>(&self, operation: F) -> FirestoreResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
            state.delayed.clear();
            state.retryable.clear();
        }
        self.push(operation.boxed())
    }

    /// Schedules `operation` to be enqueued after `delay`.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = {
            let mut state = self.lock_state();
            let id = state.next_delayed_id;
            state.next_delayed_id += 1;
            if !state.shutting_down {
                state.delayed.insert(
                    id,
                    DelayedEntry {
                        timer_id,
                        body: Box::new(move || operation().boxed()),
                    },
                );
            }
            id
        };

        let queue = self.clone();
        spawn_detached(async move {
            sleep(delay).await;
            queue.fire_delayed(id);
        });

        DelayedOperation {
            id,
            timer_id,
            queue: self.clone(),
        }
    }

    fn fire_delayed(&self, id: u64) {
        let entry = self.lock_state().delayed.remove(&id);
        if let Some(entry) = entry {
            if let Err(err) = self.enqueue((entry.body)()) {
                log::debug!("delayed operation {:?} dropped: {err}", entry.timer_id);
            }
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.lock_state()
            .delayed
            .values()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Enqueues every pending delayed operation with `timer_id` now instead
    /// of waiting for its timer. Returns how many were enqueued.
    pub fn run_delayed_operations_early(&self, timer_id: TimerId) -> usize {
        let ids: Vec<u64> = self
            .lock_state()
            .delayed
            .iter()
            .filter(|(_, entry)| entry.timer_id == timer_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.fire_delayed(*id);
        }
        ids.len()
    }

    /// Runs `operation` on the queue until it succeeds or fails with a
    /// non-retryable error. Retryable operations run one after another;
    /// each failure backs off before the next attempt.
    pub fn enqueue_retryable<F, Fut>(&self, mut operation: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let start_driver = {
            let mut state = self.lock_state();
            if state.shutting_down {
                return;
            }
            state
                .retryable
                .push_back(Box::new(move || operation().boxed()));
            !std::mem::replace(&mut state.retry_running, true)
        };
        if start_driver {
            spawn_detached(self.clone().drive_retryable());
        }
    }

    async fn drive_retryable(self) {
        loop {
            let next = {
                let mut state = self.lock_state();
                let next = state.retryable.pop_front();
                if next.is_none() {
                    state.retry_running = false;
                }
                next
            };
            let Some(mut body) = next else {
                return;
            };

            let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
            loop {
                match self.enqueue_and_wait(body()).await {
                    Ok(()) => break,
                    Err(err) if err.is_retryable() && !self.is_shutting_down() => {
                        let delay = backoff.next_delay();
                        log::debug!("retryable operation failed, retrying in {delay:?}: {err}");
                        sleep(delay).await;
                    }
                    Err(err) => {
                        log::warn!("retryable operation failed: {err}");
                        break;
                    }
                }
            }
        }
    }
}

async fn run_operations(receiver: Receiver<QueueOperation>) {
    while let Ok(operation) = receiver.recv().await {
        operation.await;
    }
}

/// Handle to a scheduled operation.
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: AsyncQueue,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running if it has not been enqueued yet.
    pub fn cancel(&self) {
        self.queue.lock_state().delayed.remove(&self.id);
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}
