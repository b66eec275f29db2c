//! Message-bus transport port.
//!
//! The resilient client only needs a narrow slice of a JetStream-like
//! transport: publish with an ack, resolve a stream, bind a durable consumer,
//! iterate deliveries and ack/nak them, and a signal fired whenever the
//! connection is (re-)established.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by a broker adapter.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Acknowledgement error: {0}")]
    Ack(String),
}

/// Broker acknowledgement of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub domain: Option<String>,
    pub duplicate: bool,
}

/// Fan-out notification fired on every successful (re)connect.
///
/// Sending never blocks: a notification nobody is waiting for is dropped.
#[derive(Debug, Clone)]
pub struct ReconnectSignal {
    tx: broadcast::Sender<()>,
}

impl ReconnectSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self { tx }
    }

    /// Wakes every task currently waiting. Returns how many were listening.
    pub fn notify(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for ReconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream<D> = BoxStream<'static, Result<D, BrokerError>>;

/// Connection to the message bus.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    type Stream: BrokerStream;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, BrokerError>;

    /// Resolves a stream by name. Fails while the stream is not provisioned
    /// or the connection is down.
    async fn get_stream(&self, name: &str) -> Result<Self::Stream, BrokerError>;

    /// Signal fired by the connection's lifecycle callbacks.
    fn reconnect_signal(&self) -> ReconnectSignal;

    /// Closes the underlying connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A resolved stream.
#[async_trait]
pub trait BrokerStream: Send + Sync + 'static {
    type Consumer: BrokerConsumer;

    /// Binds the durable consumer `name` filtered on `subject`.
    async fn consumer(&self, name: &str, subject: &str) -> Result<Self::Consumer, BrokerError>;
}

/// A bound durable consumer.
#[async_trait]
pub trait BrokerConsumer: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Starts delivery.
    async fn messages(&self) -> Result<DeliveryStream<Self::Delivery>, BrokerError>;
}

/// One delivered message.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement; the broker redelivers after `delay`.
    async fn nak(&self, delay: Duration) -> Result<(), BrokerError>;
}
