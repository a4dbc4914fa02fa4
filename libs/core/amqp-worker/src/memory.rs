//! In-process broker.
//!
//! `MemoryBroker` implements the broker traits without any network I/O. It is
//! used by the test suite and for running the consumer locally without
//! RabbitMQ. Reachability, connect failures, slow consumer cancellation and
//! connection drops can all be scripted.
//!
//! Rejected deliveries are recorded but never redelivered.

use crate::broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, ConsumerError>>;

struct MemoryConsumer {
    channel_id: u64,
    tag: String,
    queue: String,
    sender: DeliverySender,
}

struct Shared {
    reachable: bool,
    failures_remaining: u32,
    connect_attempts: u32,
    fail_declare: bool,
    cancel_delay: Option<Duration>,
    next_id: u64,
    connections: HashSet<u64>,
    /// channel id -> connection id
    channels: HashMap<u64, u64>,
    consumers: Vec<MemoryConsumer>,
    backlog: HashMap<String, VecDeque<Vec<u8>>>,
    next_delivery_tag: u64,
    round_robin: usize,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
}

impl Shared {
    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|connection_id| self.connections.contains(connection_id))
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Broker living entirely in memory.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBroker {
    /// Create a reachable broker with no queues.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                reachable: true,
                failures_remaining: 0,
                connect_attempts: 0,
                fail_declare: false,
                cancel_delay: None,
                next_id: 0,
                connections: HashSet::new(),
                channels: HashMap::new(),
                consumers: Vec::new(),
                backlog: HashMap::new(),
                next_delivery_tag: 0,
                round_robin: 0,
                acked: Vec::new(),
                rejected: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every connect attempt fail (false) or succeed (true).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Fail the next `count` connect attempts, then accept connections again.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Make topology declaration fail on every channel.
    pub fn set_fail_declare(&self, fail: bool) {
        self.lock().fail_declare = fail;
    }

    /// Delay applied to every consumer cancellation.
    pub fn set_cancel_delay(&self, delay: Option<Duration>) {
        self.lock().cancel_delay = delay;
    }

    /// Close every connection from the broker side, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut shared = self.lock();
        shared.connections.clear();
        shared.channels.clear();
        shared.consumers.clear();
    }

    /// Publish a message to `queue`.
    ///
    /// The message goes to one consumer of the queue (round robin). Without a
    /// live consumer it is kept until one registers. Returns whether it was
    /// handed to a consumer right away.
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) -> bool {
        let payload = payload.into();
        let mut shared = self.lock();

        let eligible: Vec<usize> = shared
            .consumers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.queue == queue && shared.channel_open(c.channel_id))
            .map(|(i, _)| i)
            .collect();

        if !eligible.is_empty() {
            let index = eligible[shared.round_robin % eligible.len()];
            shared.round_robin += 1;
            shared.next_delivery_tag += 1;
            let delivery = Delivery::new(shared.next_delivery_tag, queue, payload.clone());
            if shared.consumers[index].sender.send(Ok(delivery)).is_ok() {
                return true;
            }
        }

        shared
            .backlog
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        false
    }

    /// Number of connect attempts made so far.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of open channels.
    pub fn open_channels(&self) -> usize {
        let shared = self.lock();
        shared
            .channels
            .keys()
            .filter(|id| shared.channel_open(**id))
            .count()
    }

    /// Number of registered consumers.
    pub fn active_consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Tags of registered consumers.
    pub fn consumer_tags(&self) -> Vec<String> {
        self.lock().consumers.iter().map(|c| c.tag.clone()).collect()
    }

    /// Delivery tags acked so far.
    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    /// Delivery tags rejected so far, with their requeue flag.
    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.lock().rejected.clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, ConsumerError> {
        let mut shared = self.lock();
        shared.connect_attempts += 1;

        if !shared.reachable {
            return Err(ConsumerError::connect("broker unreachable"));
        }
        if shared.failures_remaining > 0 {
            shared.failures_remaining -= 1;
            return Err(ConsumerError::connect("connection refused"));
        }

        let id = shared.next_id();
        shared.connections.insert(id);
        Ok(MemoryConnection {
            id,
            broker: self.clone(),
        })
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains(&self.id)
    }

    async fn open_channel(&self) -> Result<MemoryChannel, ConsumerError> {
        let mut shared = self.broker.lock();
        if !shared.connections.contains(&self.id) {
            return Err(ConsumerError::start("connection is closed"));
        }

        let id = shared.next_id();
        shared.channels.insert(id, self.id);
        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
        })
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        let mut shared = self.broker.lock();
        shared.connections.remove(&self.id);

        let closed: HashSet<u64> = shared
            .channels
            .iter()
            .filter(|(_, connection)| **connection == self.id)
            .map(|(channel, _)| *channel)
            .collect();
        shared.channels.retain(|channel, _| !closed.contains(channel));
        shared.consumers.retain(|c| !closed.contains(&c.channel_id));
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(&self, shared: &Shared) -> Result<(), ConsumerError> {
        if shared.channel_open(self.id) {
            Ok(())
        } else {
            Err(ConsumerError::channel("channel is closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.id)
    }

    async fn declare(&self, config: &ConsumerConfig) -> Result<(), ConsumerError> {
        let shared = self.broker.lock();
        if !shared.channel_open(self.id) {
            return Err(ConsumerError::start("channel is closed"));
        }
        if shared.fail_declare {
            return Err(ConsumerError::start(format!(
                "failed to declare queue {}",
                config.queue
            )));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _auto_ack: bool,
    ) -> Result<DeliveryStream, ConsumerError> {
        let mut shared = self.broker.lock();
        if !shared.channel_open(self.id) {
            return Err(ConsumerError::start("channel is closed"));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = shared.backlog.remove(queue).unwrap_or_default();
        for payload in pending {
            shared.next_delivery_tag += 1;
            let delivery = Delivery::new(shared.next_delivery_tag, queue, payload);
            let _ = sender.send(Ok(delivery));
        }

        shared.consumers.push(MemoryConsumer {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            sender,
        });

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        let mut shared = self.broker.lock();
        self.ensure_open(&shared)?;
        shared.acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumerError> {
        let mut shared = self.broker.lock();
        self.ensure_open(&shared)?;
        shared.rejected.push((delivery_tag, requeue));
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumerError> {
        let delay = self.broker.lock().cancel_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut shared = self.broker.lock();
        self.ensure_open(&shared)?;
        shared
            .consumers
            .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        let mut shared = self.broker.lock();
        shared.channels.remove(&self.id);
        shared.consumers.retain(|c| c.channel_id != self.id);
        Ok(())
    }
}
