//! Task executor owned by the consumer manager.
//!
//! Consume loops, the connection monitor and the reconnect supervisor all run
//! here. Stopping the manager cancels the shared token and waits (bounded) for
//! every tracked task, so no task outlives the manager.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct Executor {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Token cancelled when the executor shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Cancel every task without waiting for them.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every task and wait at most `timeout` for them to finish.
    ///
    /// Returns false if tasks were still running when the timeout elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.token.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!("Executor shut down");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.active_tasks(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Executor tasks still running after shutdown timeout"
                );
                false
            }
        }
    }
}
