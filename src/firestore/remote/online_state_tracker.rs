//! Derives the client's online state from watch stream health.
//!
//! The state starts `Unknown`. A watch stream that fails to come up within
//! the timeout, or fails once without ever reaching `Online`, moves it to
//! `Offline`. Any successful watch message moves it to `Online`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::firestore::core::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::FirestoreError;

pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Failed connection attempts tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    #[default]
    Unknown,
    Online,
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_offline: bool,
}

struct TrackerInner {
    queue: AsyncQueue,
    timeout: Duration,
    handler: OnlineStateHandler,
    state: Mutex<TrackerState>,
}

#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                timeout,
                handler,
                state: Mutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    timer: None,
                    should_warn_offline: true,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// Called whenever the watch stream is (re)started.
    pub fn handle_watch_stream_start(&self) {
        let changed = {
            let mut state = self.lock();
            if state.watch_stream_failures != 0 {
                return;
            }
            let changed = Self::transition(&mut state, OnlineState::Unknown);
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            let tracker = self.clone();
            state.timer = Some(self.inner.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                self.inner.timeout,
                move || async move { tracker.on_timeout() },
            ));
            changed
        };
        self.notify(changed);
    }

    fn on_timeout(&self) {
        let changed = {
            let mut state = self.lock();
            state.timer = None;
            if state.state != OnlineState::Unknown {
                return;
            }
            Self::log_offline(
                &mut state,
                &format!(
                    "backend did not respond within {} seconds",
                    self.inner.timeout.as_secs()
                ),
            );
            Self::transition(&mut state, OnlineState::Offline)
        };
        self.notify(changed);
    }

    /// Called when the watch stream fails or closes with an error.
    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let changed = {
            let mut state = self.lock();
            if state.state == OnlineState::Online {
                Self::transition(&mut state, OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    if let Some(timer) = state.timer.take() {
                        timer.cancel();
                    }
                    let reason =
                        format!("connection failed {} times: {error}", state.watch_stream_failures);
                    Self::log_offline(&mut state, &reason);
                    Self::transition(&mut state, OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        self.notify(changed);
    }

    /// Explicit transition, used for `Online` after a watch message and for
    /// network toggles. Resets the failure count.
    pub fn set(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.lock();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_offline = false;
            }
            Self::transition(&mut state, new_state)
        };
        self.notify(changed);
    }

    fn transition(state: &mut TrackerState, new_state: OnlineState) -> Option<OnlineState> {
        if state.state == new_state {
            return None;
        }
        state.state = new_state;
        Some(new_state)
    }

    fn log_offline(state: &mut TrackerState, details: &str) {
        let message = format!(
            "could not reach the backend ({details}); the client will operate in offline mode"
        );
        if state.should_warn_offline {
            log::warn!("{message}");
            state.should_warn_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn notify(&self, changed: Option<OnlineState>) {
        if let Some(state) = changed {
            (self.inner.handler)(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker(timeout: Duration) -> (OnlineStateTracker, AsyncQueue, Arc<Mutex<Vec<OnlineState>>>) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            timeout,
            Arc::new(move |state| sink.lock().unwrap().push(state)),
        );
        (tracker, queue, seen)
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (tracker, _queue, seen) = tracker(Duration::from_secs(10));
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(&unavailable("down"));
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn failure_while_online_only_drops_to_unknown() {
        let (tracker, _queue, seen) = tracker(Duration::from_secs(10));
        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure(&unavailable("reset"));
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn timeout_reports_offline() {
        let (tracker, queue, _seen) = tracker(Duration::from_secs(10));
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(queue.run_delayed_operations_early(TimerId::OnlineStateTimeout), 1);
        queue.enqueue_and_wait(async { Ok(()) }).await.unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[tokio::test]
    async fn going_online_cancels_the_timer() {
        let (tracker, queue, _seen) = tracker(Duration::from_secs(10));
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
