use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::warn!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns an async task that runs in the background.
///
/// Uses the ambient tokio runtime when called from inside one, and a shared
/// background runtime otherwise.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    } else {
        log::warn!("no tokio runtime available; dropping background task");
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_task_runs_on_ambient_runtime() {
        let (sender, receiver) = async_channel::bounded(1);
        spawn_detached(async move {
            let _ = sender.send(7u8).await;
        });
        assert_eq!(receiver.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        sleep(Duration::ZERO).await;
    }
}
