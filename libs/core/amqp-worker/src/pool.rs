//! Ordered collection of workers.

use crate::broker::Broker;
use crate::error::ConsumerError;
use crate::worker::{Worker, WorkerContext, WorkerState};
use tracing::{debug, warn};

pub struct WorkerPool<B: Broker> {
    workers: Vec<Worker<B>>,
}

impl<B: Broker> WorkerPool<B> {
    /// A pool with no workers.
    pub fn empty() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    /// Construct exactly `count` workers, none of them started.
    pub fn create_all(count: usize, ctx: &WorkerContext<B>) -> Result<Self, ConsumerError> {
        if count == 0 {
            return Err(ConsumerError::config(
                "concurrent_consumers must be greater than zero",
            ));
        }

        let workers = (0..count).map(|id| Worker::new(id, ctx.clone())).collect();
        debug!(count, "Created workers");
        Ok(Self { workers })
    }

    /// Start workers in creation order, stopping at the first failure.
    ///
    /// Workers started before the failure stay started.
    pub async fn start_all(&mut self) -> Result<(), ConsumerError> {
        for worker in &mut self.workers {
            worker.start().await?;
        }
        debug!(count = self.workers.len(), "All workers started");
        Ok(())
    }

    /// Reconnect workers in creation order, stopping at the first failure.
    pub async fn reconnect_all(&mut self) -> Result<(), ConsumerError> {
        for worker in &mut self.workers {
            worker.reconnect().await?;
        }
        Ok(())
    }

    /// Ask every worker to stop and return the first error seen.
    pub async fn stop_all(&mut self) -> Result<(), ConsumerError> {
        let mut first_error = None;

        for worker in &mut self.workers {
            if let Err(e) = worker.stop().await {
                warn!(worker = worker.id(), error = %e, "Error stopping worker");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop every worker.
    pub fn clear(&mut self) {
        self.workers.clear();
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(Worker::state).collect()
    }

    /// Number of workers currently consuming.
    pub fn started_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_healthy()).count()
    }
}
