//! Broker abstraction.
//!
//! The manager only talks to the broker through these three traits:
//! - [`Broker`] opens connections
//! - [`BrokerConnection`] opens channels and reports liveness
//! - [`BrokerChannel`] declares topology, consumes and acknowledges
//!
//! [`LapinBroker`](crate::LapinBroker) implements them over AMQP 0-9-1 and
//! [`MemoryBroker`](crate::MemoryBroker) implements them in-process.

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// A message handed to a worker by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject the delivery
    pub delivery_tag: u64,

    /// Exchange the message was published to
    pub exchange: String,

    /// Routing key the message was published with
    pub routing_key: String,

    /// Whether the broker delivered this message before
    pub redelivered: bool,

    /// Content type property, if set by the publisher
    pub content_type: Option<String>,

    /// Correlation id property, if set by the publisher
    pub correlation_id: Option<String>,

    /// Message id property, if set by the publisher
    pub message_id: Option<String>,

    /// Raw message body
    pub payload: Vec<u8>,

    /// When the worker received the delivery
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// Create a delivery with only tag, routing key and body set
    pub fn new(delivery_tag: u64, routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: routing_key.into(),
            redelivered: false,
            content_type: None,
            correlation_id: None,
            message_id: None,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Decode the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Stream of deliveries for one consumer. It ends (or yields an error) when the
/// consumer is cancelled or the underlying channel/connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConsumerError>>;

/// Channel type of a broker.
pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connection type produced by this broker
    type Connection: BrokerConnection;

    /// Open a new connection.
    ///
    /// Fails with [`ConsumerError::Connect`] when no address is reachable or the
    /// handshake (credentials, TLS) is rejected.
    async fn connect(&self) -> Result<Self::Connection, ConsumerError>;
}

/// One logical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Channel type produced by this connection
    type Channel: BrokerChannel;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Open a channel over this connection.
    async fn open_channel(&self) -> Result<Self::Channel, ConsumerError>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), ConsumerError>;
}

/// One channel, owned by exactly one worker.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Whether the channel (and its connection) is still usable.
    fn is_open(&self) -> bool;

    /// Apply QoS and declare exchange, queue and binding as configured.
    async fn declare(&self, config: &ConsumerConfig) -> Result<(), ConsumerError>;

    /// Register a consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, ConsumerError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError>;

    /// Reject a delivery, optionally putting it back on the queue.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumerError>;

    /// Cancel a consumer registered with [`consume`](Self::consume).
    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumerError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), ConsumerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    #[test]
    fn test_delivery_json() {
        let delivery = Delivery::new(7, "orders", br#"{"id":42}"#.to_vec());

        assert_eq!(delivery.delivery_tag, 7);
        assert!(!delivery.redelivered);
        assert_eq!(delivery.json::<Order>().unwrap(), Order { id: 42 });
    }

    #[test]
    fn test_delivery_json_invalid() {
        let delivery = Delivery::new(1, "orders", b"nope".to_vec());
        assert!(delivery.json::<Order>().is_err());
    }
}
