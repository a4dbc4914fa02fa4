//! Background reconnect loop.
//!
//! A supervisor runs one recovery campaign: it reconnects every worker and
//! starts the pool, retrying the whole pass at a fixed interval until a pass
//! succeeds or it is cancelled. Then it exits.

use crate::broker::Broker;
use crate::error::ConsumerError;
use crate::executor::Executor;
use crate::metrics::ConsumerMetrics;
use crate::pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a recovery campaign ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Every worker was reconnected and started
    Succeeded { attempts: u32 },
    /// Stopped by stop or suspend before succeeding
    Cancelled,
}

pub struct ReconnectSupervisor<B: Broker> {
    pool: Arc<Mutex<WorkerPool<B>>>,
    interval: Duration,
    cancel: CancellationToken,
    metrics: ConsumerMetrics,
}

impl<B: Broker> ReconnectSupervisor<B> {
    pub fn new(
        pool: Arc<Mutex<WorkerPool<B>>>,
        interval: Duration,
        cancel: CancellationToken,
        metrics: ConsumerMetrics,
    ) -> Self {
        Self {
            pool,
            interval,
            cancel,
            metrics,
        }
    }

    /// Run the campaign on `executor`.
    pub fn spawn(self, executor: &Executor) -> SupervisorHandle {
        let cancel = self.cancel.clone();
        let task = executor.spawn(self.run());
        SupervisorHandle { cancel, task }
    }

    /// Run the campaign to completion on the current task.
    pub async fn run(self) -> SupervisorOutcome {
        let mut attempts: u32 = 0;
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting reconnect supervisor"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!(attempts, "Reconnect supervisor cancelled");
                return SupervisorOutcome::Cancelled;
            }
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(attempts, "Reconnect supervisor cancelled during attempt");
                    return SupervisorOutcome::Cancelled;
                }
                result = self.pass() => result,
            };

            match result {
                Ok(started) => {
                    self.metrics.reconnect_attempt(true);
                    self.metrics.active_workers(started);
                    info!(attempts, workers = started, "Reconnected and restarted consumers");
                    return SupervisorOutcome::Succeeded { attempts };
                }
                Err(e) => {
                    self.metrics.reconnect_attempt(false);
                    if e.is_recoverable() {
                        info!(
                            attempt = attempts,
                            error = %e,
                            retry_in_ms = self.interval.as_millis() as u64,
                            "Reconnect attempt failed, retrying"
                        );
                    } else {
                        error!(attempt = attempts, error = %e, "Reconnect attempt failed");
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(attempts, "Reconnect supervisor cancelled while waiting");
                    return SupervisorOutcome::Cancelled;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Reconnect every worker, then start the pool.
    async fn pass(&self) -> Result<usize, ConsumerError> {
        let mut pool = self.pool.lock().await;
        pool.reconnect_all().await?;
        pool.start_all().await?;
        Ok(pool.started_count())
    }
}

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<SupervisorOutcome>,
}

impl SupervisorHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the supervisor to exit.
    ///
    /// Returns None when the task panicked or was aborted.
    pub async fn join(self) -> Option<SupervisorOutcome> {
        match self.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "Reconnect supervisor did not finish cleanly");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::connection::ConnectionHandle;
    use crate::memory::MemoryBroker;
    use crate::processor::NoOpProcessor;
    use crate::worker::WorkerContext;
    use tokio::sync::mpsc;

    type SharedPool = Arc<Mutex<WorkerPool<MemoryBroker>>>;

    fn pool(broker: &MemoryBroker, count: usize) -> (SharedPool, Arc<Executor>) {
        let metrics = ConsumerMetrics::new("orders");
        let config = ConsumerConfig::new("memory://", "orders");
        let connection = Arc::new(ConnectionHandle::new(
            Arc::new(broker.clone()),
            config.close_timeout(),
            metrics.clone(),
        ));
        let executor = Arc::new(Executor::new());
        let (events, _receiver) = mpsc::unbounded_channel();
        let ctx = WorkerContext::new(
            connection,
            Arc::new(NoOpProcessor),
            Arc::new(config),
            Arc::clone(&executor),
            events,
            metrics,
        );
        let pool = WorkerPool::create_all(count, &ctx).unwrap();
        (Arc::new(Mutex::new(pool)), executor)
    }

    fn supervisor(pool: &SharedPool, interval: Duration) -> ReconnectSupervisor<MemoryBroker> {
        ReconnectSupervisor::new(
            Arc::clone(pool),
            interval,
            CancellationToken::new(),
            ConsumerMetrics::new("orders"),
        )
    }

    #[tokio::test]
    async fn test_retries_until_broker_is_reachable() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let (pool, executor) = pool(&broker, 2);

        let handle = supervisor(&pool, Duration::from_millis(10)).spawn(&executor);
        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap();

        assert_eq!(outcome, Some(SupervisorOutcome::Succeeded { attempts: 3 }));
        assert_eq!(pool.lock().await.started_count(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_sleep() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let (pool, executor) = pool(&broker, 1);

        let handle = supervisor(&pool, Duration::from_secs(10)).spawn(&executor);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let outcome = tokio::time::timeout(Duration::from_millis(500), handle.join())
            .await
            .unwrap();
        assert_eq!(outcome, Some(SupervisorOutcome::Cancelled));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(pool.lock().await.started_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_pass_does_nothing() {
        let broker = MemoryBroker::new();
        let (pool, _executor) = pool(&broker, 1);

        let supervisor = supervisor(&pool, Duration::from_millis(10));
        supervisor.cancel.cancel();

        assert_eq!(supervisor.run().await, SupervisorOutcome::Cancelled);
        assert_eq!(broker.connect_attempts(), 0);
    }
}
