use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use log::debug;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Spawns background workers whose lifetimes are tracked and which can all be cancelled at once.
#[derive(Clone, Debug, Default)]
pub struct Workers {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Workers {
    pub fn new() -> Self {
        Workers::default()
    }

    /// A token that is cancelled on [`Workers::shutdown`], or earlier by its owner.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Worker {} cancelled", name);
                },
                _ = future => {
                    debug!("Worker {} finished", name);
                },
            }
        })
    }

    /// Number of workers still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn shutdown(&self) {
        self.tracker.close();
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
