// Background task registry
//
// Every reader, muxer loop, watchdog and pump the manager starts is
// spawned here, so shutdown is one sweep over a single set.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a tracked task. The returned handle aborts just this task.
    ///
    /// After shutdown the future is dropped without running and the
    /// returned handle refers to an already finished task.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            reap(result);
        }

        if token.is_cancelled() {
            debug!(task = name, "Registry shut down, task not started");
            return tasks.spawn(async {});
        }

        tasks.spawn(async move {
            tokio::select! {
                () = future => {}
                () = token.cancelled() => debug!(task = name, "Task cancelled"),
            }
        })
    }

    /// Tasks spawned and not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels every task and waits until all of them have terminated.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.abort_all();
        while let Some(result) = tasks.join_next().await {
            reap(result);
        }
    }
}

fn reap(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(error = %e, "Background task panicked");
        }
    }
}
