//! # InMemoryBroker
//!
//! [`MessageBroker`] double for exercising the resilient client.
//!
//! Streams exist only once provisioned, consumers can be told to fail a
//! number of times, and every ack and nak is recorded. A published message
//! is accepted when a stream named after the subject's first segment exists
//! and is delivered to every running consumer filtered on that subject.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use outbox_core::pubsub::{
    BrokerConsumer, BrokerError, BrokerStream, Delivery, DeliveryStream, MessageBroker, PublishAck,
    ReconnectSignal,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack { subject: String, payload: Vec<u8> },
    Nak { subject: String, payload: Vec<u8>, delay: Duration },
}

#[derive(Default)]
struct BrokerState {
    streams: Mutex<HashMap<String, StreamState>>,
    /// subject -> senders of the consumers filtered on it
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<InMemoryDelivery>>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    outcomes: Arc<Mutex<Vec<DeliveryOutcome>>>,
    sequence: AtomicU64,
    get_stream_calls: AtomicUsize,
    close_calls: AtomicUsize,
    fail_publish: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicBool,
    signal: ReconnectSignal,
}

#[derive(Default)]
struct StreamState {
    /// consumer name -> remaining forced failures
    failing_consumers: HashMap<String, usize>,
    failing_messages: HashMap<String, usize>,
    bound: Vec<String>,
}

/// In-memory message broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `stream` (no-op if it exists).
    pub fn provision_stream(&self, stream: &str) {
        self.state
            .streams
            .lock()
            .entry(stream.to_string())
            .or_default();
    }

    pub fn remove_stream(&self, stream: &str) {
        self.state.streams.lock().remove(stream);
    }

    /// Fails the next `times` attempts to bind consumer `name` on `stream`.
    pub fn fail_consumer(&self, stream: &str, name: &str, times: usize) {
        self.state
            .streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .failing_consumers
            .insert(name.to_string(), times);
    }

    /// Fails the next `times` attempts to start delivery for consumer `name`.
    pub fn fail_messages(&self, stream: &str, name: &str, times: usize) {
        self.state
            .streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .failing_messages
            .insert(name.to_string(), times);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Fires the reconnect signal as a real connection would after recovering.
    pub fn trigger_reconnect(&self) -> usize {
        self.state.signal.notify()
    }

    /// Consumer names bound on `stream`, in bind order.
    pub fn bound_consumers(&self, stream: &str) -> Vec<String> {
        self.state
            .streams
            .lock()
            .get(stream)
            .map(|s| s.bound.clone())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.published.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.state.outcomes.lock().clone()
    }

    pub fn get_stream_calls(&self) -> usize {
        self.state.get_stream_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Delivers `payload` on `subject` without going through publish.
    /// Returns the number of consumers reached.
    pub fn deliver(&self, subject: &str, payload: &[u8]) -> usize {
        let mut subscribers = self.state.subscribers.lock();
        let Some(senders) = subscribers.get_mut(subject) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| {
                tx.send(InMemoryDelivery {
                    subject: subject.to_string(),
                    payload: payload.to_vec(),
                    outcomes: Arc::clone(&self.state.outcomes),
                })
                .is_ok()
            })
            .count()
    }
}

fn take_failure(failures: &mut HashMap<String, usize>, name: &str) -> bool {
    match failures.get_mut(name) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    type Stream = InMemoryStream;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, BrokerError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }
        let stream = subject.split('.').next().unwrap_or_default().to_string();
        if !self.state.streams.lock().contains_key(&stream) {
            return Err(BrokerError::Publish(format!(
                "no stream captures subject {subject}"
            )));
        }

        self.state
            .published
            .lock()
            .push((subject.to_string(), payload.clone()));
        self.deliver(subject, &payload);

        Ok(PublishAck {
            stream,
            sequence: self.state.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            domain: None,
            duplicate: false,
        })
    }

    async fn get_stream(&self, name: &str) -> Result<InMemoryStream, BrokerError> {
        self.state.get_stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        if !self.state.streams.lock().contains_key(name) {
            return Err(BrokerError::Stream(format!("stream not found: {name}")));
        }
        Ok(InMemoryStream {
            name: name.to_string(),
            broker: self.clone(),
        })
    }

    fn reconnect_signal(&self) -> ReconnectSignal {
        self.state.signal.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.subscribers.lock().clear();
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("injected close failure".to_string()));
        }
        Ok(())
    }
}

/// Provisioned stream handle.
pub struct InMemoryStream {
    name: String,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerStream for InMemoryStream {
    type Consumer = InMemoryConsumer;

    async fn consumer(&self, name: &str, subject: &str) -> Result<InMemoryConsumer, BrokerError> {
        let mut streams = self.broker.state.streams.lock();
        let stream = streams
            .get_mut(&self.name)
            .ok_or_else(|| BrokerError::Stream(format!("stream not found: {}", self.name)))?;
        if take_failure(&mut stream.failing_consumers, name) {
            return Err(BrokerError::Consumer(format!(
                "injected failure binding consumer {name}"
            )));
        }
        stream.bound.push(name.to_string());
        Ok(InMemoryConsumer {
            stream: self.name.clone(),
            name: name.to_string(),
            subject: subject.to_string(),
            broker: self.broker.clone(),
        })
    }
}

/// Bound consumer handle.
pub struct InMemoryConsumer {
    stream: String,
    name: String,
    subject: String,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    type Delivery = InMemoryDelivery;

    async fn messages(&self) -> Result<DeliveryStream<InMemoryDelivery>, BrokerError> {
        let injected = self
            .broker
            .state
            .streams
            .lock()
            .get_mut(&self.stream)
            .is_some_and(|stream| take_failure(&mut stream.failing_messages, &self.name));
        if injected {
            return Err(BrokerError::Consumer(format!(
                "injected failure starting delivery for {}",
                self.name
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .state
            .subscribers
            .lock()
            .entry(self.subject.clone())
            .or_default()
            .push(tx);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }
}

/// One in-memory delivery; its ack or nak is recorded on the broker.
pub struct InMemoryDelivery {
    subject: String,
    payload: Vec<u8>,
    outcomes: Arc<Mutex<Vec<DeliveryOutcome>>>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.outcomes.lock().push(DeliveryOutcome::Ack {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
        });
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> Result<(), BrokerError> {
        self.outcomes.lock().push(DeliveryOutcome::Nak {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            delay,
        });
        Ok(())
    }
}
