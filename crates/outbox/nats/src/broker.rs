//! # JetStreamBroker
//!
//! [`MessageBroker`] over an `async-nats` connection.
//!
//! The connection reconnects on its own; every `Connected` event fires the
//! broker's [`ReconnectSignal`] so the resilient client can retry failed
//! subscriptions immediately instead of waiting for its interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::consumer::{AckPolicy, PullConsumer, pull};
use async_nats::jetstream::{self, AckKind};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use outbox_core::pubsub::{
    BrokerConsumer, BrokerError, BrokerStream, Delivery, DeliveryStream, MessageBroker, PublishAck,
    ReconnectSignal,
};
use tracing::{debug, info, instrument, warn};

use crate::config::NatsConfig;

/// JetStream-backed message broker.
#[derive(Clone)]
pub struct JetStreamBroker {
    client: Client,
    context: jetstream::Context,
    signal: ReconnectSignal,
    create_consumers: bool,
    closed: Arc<AtomicBool>,
}

impl JetStreamBroker {
    /// Connects to NATS.
    ///
    /// The first connection is retried in the background, so this returns
    /// even while the server is unreachable; the reconnect signal fires once
    /// it comes up.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Connection`] when the options are invalid.
    #[instrument(skip_all, fields(url = %config.url))]
    pub async fn connect(config: &NatsConfig) -> Result<Self, BrokerError> {
        let signal = ReconnectSignal::new();
        let callback_signal = signal.clone();

        let mut options = ConnectOptions::new()
            .connection_timeout(config.connection_timeout())
            .retry_on_initial_connect()
            .event_callback(move |event| {
                let signal = callback_signal.clone();
                async move {
                    match event {
                        Event::Connected => {
                            let listeners = signal.notify();
                            info!(listeners, "NATS connected");
                        }
                        Event::Disconnected => warn!("NATS disconnected"),
                        other => debug!(event = %other, "NATS connection event"),
                    }
                }
            });
        if let Some(name) = &config.client_name {
            options = options.name(name);
        }

        let client = async_nats::connect_with_options(config.url.as_str(), options)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self::from_client(client, signal, config.create_consumers))
    }

    /// Wraps an existing client. `signal` must be fired by the client's
    /// event callback for reconnects to be observed.
    pub fn from_client(client: Client, signal: ReconnectSignal, create_consumers: bool) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            signal,
            create_consumers,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl MessageBroker for JetStreamBroker {
    type Stream = JetStreamStream;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }

        let ack = self
            .context
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            domain: Some(ack.domain).filter(|domain| !domain.is_empty()),
            duplicate: ack.duplicate,
        })
    }

    async fn get_stream(&self, name: &str) -> Result<JetStreamStream, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }

        let stream = self
            .context
            .get_stream(name)
            .await
            .map_err(|e| BrokerError::Stream(format!("{name}: {e}")))?;
        Ok(JetStreamStream {
            stream,
            create_consumers: self.create_consumers,
        })
    }

    fn reconnect_signal(&self) -> ReconnectSignal {
        self.signal.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Pending publishes are flushed before the connection closes.
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!("NATS connection drained and closed");
        Ok(())
    }
}

/// Resolved JetStream stream.
pub struct JetStreamStream {
    stream: jetstream::stream::Stream,
    create_consumers: bool,
}

#[async_trait]
impl BrokerStream for JetStreamStream {
    type Consumer = JetStreamConsumer;

    async fn consumer(&self, name: &str, subject: &str) -> Result<JetStreamConsumer, BrokerError> {
        let consumer: PullConsumer = if self.create_consumers {
            self.stream
                .get_or_create_consumer(
                    name,
                    pull::Config {
                        durable_name: Some(name.to_string()),
                        filter_subject: subject.to_string(),
                        ack_policy: AckPolicy::Explicit,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| BrokerError::Consumer(format!("{name}: {e}")))?
        } else {
            self.stream
                .get_consumer(name)
                .await
                .map_err(|e| BrokerError::Consumer(format!("{name}: {e}")))?
        };
        Ok(JetStreamConsumer { consumer })
    }
}

/// Bound durable pull consumer.
pub struct JetStreamConsumer {
    consumer: PullConsumer,
}

#[async_trait]
impl BrokerConsumer for JetStreamConsumer {
    type Delivery = JetStreamDelivery;

    async fn messages(&self) -> Result<DeliveryStream<JetStreamDelivery>, BrokerError> {
        let messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        Ok(messages
            .map(|result| {
                result
                    .map(|message| JetStreamDelivery { message })
                    .map_err(|e| BrokerError::Consumer(e.to_string()))
            })
            .boxed())
    }
}

/// JetStream message awaiting acknowledgement.
pub struct JetStreamDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> Result<(), BrokerError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
