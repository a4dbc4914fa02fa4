//! A single consuming worker.
//!
//! Each worker owns one channel on the shared connection and, while started,
//! one consume task on the manager's executor. The consume task settles every
//! delivery with the broker and reports a lost connection back to the manager.

use crate::broker::{Broker, BrokerChannel, BrokerConnection, ChannelOf, Delivery, DeliveryStream};
use crate::config::ConsumerConfig;
use crate::connection::ConnectionHandle;
use crate::error::ConsumerError;
use crate::executor::Executor;
use crate::metrics::ConsumerMetrics;
use crate::processor::{Acknowledgement, DeliveryProcessor};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Constructed, no channel yet
    Created,
    /// Bound to a channel but not consuming
    ReconnectPending,
    /// Consuming deliveries
    Started,
    /// Stopped for good
    Stopped,
}

/// Events sent from consume tasks to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The delivery stream ended without a stop being requested
    ConnectionLost { worker_id: usize },
}

/// Everything a worker shares with its siblings.
pub struct WorkerContext<B: Broker> {
    pub(crate) connection: Arc<ConnectionHandle<B>>,
    pub(crate) processor: Arc<dyn DeliveryProcessor>,
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) metrics: ConsumerMetrics,
}

impl<B: Broker> WorkerContext<B> {
    pub(crate) fn new(
        connection: Arc<ConnectionHandle<B>>,
        processor: Arc<dyn DeliveryProcessor>,
        config: Arc<ConsumerConfig>,
        executor: Arc<Executor>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        metrics: ConsumerMetrics,
    ) -> Self {
        Self {
            connection,
            processor,
            config,
            executor,
            events,
            metrics,
        }
    }
}

impl<B: Broker> Clone for WorkerContext<B> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            processor: Arc::clone(&self.processor),
            config: Arc::clone(&self.config),
            executor: Arc::clone(&self.executor),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

struct Consumption {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Consumption {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    fn discard(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// One parallel unit of consumption.
pub struct Worker<B: Broker> {
    id: usize,
    tag: String,
    ctx: WorkerContext<B>,
    state: WorkerState,
    channel: Option<Arc<ChannelOf<B>>>,
    consumption: Option<Consumption>,
}

impl<B: Broker> Worker<B> {
    /// Create a worker. No I/O happens until it is started or reconnected.
    pub fn new(id: usize, ctx: WorkerContext<B>) -> Self {
        let tag = ctx.config.consumer_tag(id);
        Self {
            id,
            tag,
            ctx,
            state: WorkerState::Created,
            channel: None,
            consumption: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Started, on an open channel, with a live consume task.
    pub fn is_healthy(&self) -> bool {
        self.state == WorkerState::Started
            && self.channel.as_ref().is_some_and(|c| c.is_open())
            && self.consumption.as_ref().is_some_and(Consumption::is_running)
    }

    /// Bind (if needed) and begin consuming.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        if self.state == WorkerState::Stopped {
            return Err(ConsumerError::start(format!(
                "worker {} is stopped and cannot be started again",
                self.id
            )));
        }
        if self.is_healthy() {
            return Ok(());
        }

        if let Some(stale) = self.consumption.take() {
            stale.discard();
            self.discard_channel().await;
        }

        let channel = self.ensure_bound().await?;
        let deliveries = channel
            .consume(&self.ctx.config.queue, &self.tag, self.ctx.config.auto_ack)
            .await?;

        let cancel = self.ctx.executor.child_token();
        let consume_loop = ConsumeLoop {
            worker_id: self.id,
            channel,
            processor: Arc::clone(&self.ctx.processor),
            auto_ack: self.ctx.config.auto_ack,
            cancel: cancel.clone(),
            events: self.ctx.events.clone(),
            metrics: self.ctx.metrics.clone(),
        };
        let task = self.ctx.executor.spawn(consume_loop.run(deliveries));

        self.consumption = Some(Consumption { cancel, task });
        self.state = WorkerState::Started;
        info!(
            worker = self.id,
            consumer_tag = %self.tag,
            queue = %self.ctx.config.queue,
            "Worker started"
        );
        Ok(())
    }

    /// Cancel the consumer, close the channel and wait for the consume task.
    ///
    /// The worker is Stopped afterwards even when this fails.
    pub async fn stop(&mut self) -> Result<(), ConsumerError> {
        if self.state == WorkerState::Stopped {
            return Ok(());
        }
        self.state = WorkerState::Stopped;

        let timeout = self.ctx.config.stop_timeout();
        let channel = self.channel.take();
        let mut consumption = self.consumption.take();

        if let Some(consumption) = &consumption {
            consumption.cancel.cancel();
        }

        let graceful = async {
            if let Some(channel) = &channel {
                if consumption.is_some() && channel.is_open() {
                    if let Err(e) = channel.cancel(&self.tag).await {
                        warn!(worker = self.id, error = %e, "Failed to cancel consumer");
                    }
                }
                if channel.is_open() {
                    if let Err(e) = channel.close().await {
                        warn!(worker = self.id, error = %e, "Failed to close channel");
                    }
                }
            }
            if let Some(consumption) = consumption.as_mut() {
                if let Err(e) = (&mut consumption.task).await {
                    if e.is_panic() {
                        error!(worker = self.id, "Consume task panicked");
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, graceful).await;
        match outcome {
            Ok(()) => {
                debug!(worker = self.id, "Worker stopped");
                Ok(())
            }
            Err(_) => {
                if let Some(consumption) = consumption {
                    consumption.task.abort();
                }
                warn!(
                    worker = self.id,
                    consumer_tag = %self.consumer_tag(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker did not stop in time"
                );
                Err(ConsumerError::StopTimeout {
                    worker: self.tag.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Rebind using the current connection.
    ///
    /// A healthy worker is left alone. Otherwise any stale consumption and
    /// binding is discarded and a fresh channel is bound, leaving the worker
    /// ReconnectPending until the next start.
    pub async fn reconnect(&mut self) -> Result<(), ConsumerError> {
        if self.state == WorkerState::Stopped {
            return Err(ConsumerError::start(format!(
                "worker {} is stopped and cannot be reconnected",
                self.id
            )));
        }
        if self.is_healthy() {
            return Ok(());
        }

        if let Some(stale) = self.consumption.take() {
            stale.discard();
        }
        let bound_and_idle = self.state == WorkerState::ReconnectPending
            && self.channel.as_ref().is_some_and(|c| c.is_open());
        if !bound_and_idle {
            self.discard_channel().await;
        }

        self.ensure_bound().await?;
        self.state = WorkerState::ReconnectPending;
        debug!(worker = self.id, "Worker rebound");
        Ok(())
    }

    async fn ensure_bound(&mut self) -> Result<Arc<ChannelOf<B>>, ConsumerError> {
        if let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(channel));
        }
        self.channel = None;

        let connection = self.ctx.connection.acquire().await?;
        let channel = connection.open_channel().await?;
        channel.declare(&self.ctx.config).await?;

        let channel = Arc::new(channel);
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn discard_channel(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if !channel.is_open() {
            return;
        }
        let timeout = self.ctx.config.stop_timeout();
        match tokio::time::timeout(timeout, channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(worker = self.id, error = %e, "Failed to close stale channel"),
            Err(_) => debug!(worker = self.id, "Timed out closing stale channel"),
        }
    }
}

struct ConsumeLoop<C: BrokerChannel> {
    worker_id: usize,
    channel: Arc<C>,
    processor: Arc<dyn DeliveryProcessor>,
    auto_ack: bool,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
    metrics: ConsumerMetrics,
}

impl<C: BrokerChannel> ConsumeLoop<C> {
    async fn run(self, mut deliveries: DeliveryStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.worker_id, "Consume loop cancelled");
                    return;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery).await,
                Some(Err(e)) => {
                    warn!(worker = self.worker_id, error = %e, "Delivery stream failed");
                    break;
                }
                None => break,
            }
        }

        if self.cancel.is_cancelled() {
            return;
        }

        warn!(worker = self.worker_id, "Consumer lost its connection");
        self.metrics.connection_lost();
        if self
            .events
            .send(WorkerEvent::ConnectionLost {
                worker_id: self.worker_id,
            })
            .is_err()
        {
            debug!(worker = self.worker_id, "Manager no longer listening for worker events");
        }
    }

    async fn handle(&self, delivery: Delivery) {
        self.metrics.delivery_received();
        let started = Instant::now();
        let result = self.processor.process(&delivery).await;

        if let Err(e) = &result {
            warn!(
                worker = self.worker_id,
                delivery_tag = delivery.delivery_tag,
                processor = self.processor.name(),
                category = e.category().as_str(),
                error = %e,
                "Delivery processing failed"
            );
        }

        match Acknowledgement::for_result(&result) {
            Acknowledgement::Ack => {
                if !self.auto_ack {
                    if let Err(e) = self.channel.ack(delivery.delivery_tag).await {
                        warn!(worker = self.worker_id, error = %e, "Failed to ack delivery");
                        return;
                    }
                }
                self.metrics.delivery_acked(started.elapsed());
            }
            Acknowledgement::Reject { requeue } => {
                if !self.auto_ack {
                    if let Err(e) = self.channel.reject(delivery.delivery_tag, requeue).await {
                        warn!(worker = self.worker_id, error = %e, "Failed to reject delivery");
                        return;
                    }
                }
                let category = result
                    .as_ref()
                    .err()
                    .map(|e| e.category().as_str())
                    .unwrap_or("unknown");
                self.metrics
                    .delivery_rejected(category, requeue && !self.auto_ack);
            }
        }
    }
}
