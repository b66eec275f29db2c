//! Resilient pub/sub client.
//!
//! Wraps a [`MessageBroker`] so that subjects which cannot be bound at
//! subscribe time (stream not provisioned yet, consumer missing, broker
//! down) are retried in the background instead of failing the caller.
//!
//! ```text
//! subscribe(handlers)
//!   ├── stream lookup fails        → whole stream deferred
//!   ├── malformed subject          → hard error, nothing retried
//!   ├── consumer/bind fails        → subject deferred
//!   └── failed set non-empty       → retry task
//!                                     waits for: reconnect | interval | cancel
//!                                     then subscribe(failed set)
//! ```
//!
//! Delivered messages run through the registered handler; `Ok` acks, `Err`
//! naks with a fixed delay (unless nak-on-error is disabled, in which case
//! the broker's ack timeout drives redelivery).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::broker::{
    BrokerConsumer, BrokerError, BrokerStream, Delivery, MessageBroker, ReconnectSignal,
};
use super::handler::{MessageContext, StreamHandlers, SubjectHandler, subject_count};
use crate::error::{Classify, ErrorCategory};
use crate::outbox::trace_id_from_payload;
use crate::publisher::Publisher;

/// Errors returned by [`PubSubClient`] operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The subject does not have exactly two non-empty dot-separated segments.
    #[error("Invalid message subject {subject}: expected <domain>.<event>")]
    InvalidSubject { subject: String },

    #[error("Failed to publish message into subject {subject}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BrokerError,
    },

    #[error("Failed to close client: {0}")]
    Close(#[source] BrokerError),

    #[error("Client is closed")]
    Closed,
}

impl PubSubError {
    /// Structural errors are caused by the input and are never retried.
    #[inline]
    pub fn is_structural(&self) -> bool {
        matches!(self, PubSubError::InvalidSubject { .. })
    }
}

impl Classify for PubSubError {
    fn category(&self) -> ErrorCategory {
        if self.is_structural() {
            ErrorCategory::Validation
        } else {
            ErrorCategory::Infrastructure
        }
    }
}

/// Publish/subscribe client contract.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Publishes once; failures are returned unchanged, never retried here.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PubSubError>;

    /// Binds every subject in `handlers`.
    ///
    /// Only structural errors are returned. Subjects that fail to bind for
    /// any other reason are retried in the background until they succeed or
    /// `cancel` fires.
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        handlers: StreamHandlers,
    ) -> Result<(), PubSubError>;

    /// Stops consumers, closes the connection and waits for retry tasks.
    async fn close(&self) -> Result<(), PubSubError>;
}

/// Configuration for [`ResilientPubSubClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilientClientConfig {
    /// Service identity used to derive durable consumer names.
    pub service_name: String,
    /// Upper bound on the wait between resubscribe attempts.
    pub resubscribe_interval: Duration,
    /// Redelivery delay requested when a handler fails.
    pub nack_delay: Duration,
    /// Leave failed messages unacknowledged instead of nak-ing them.
    pub without_nack_on_errors: bool,
    /// Read the `traceId` payload field into [`MessageContext::trace_id`].
    pub with_trace: bool,
}

impl ResilientClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            resubscribe_interval: Duration::from_secs(60),
            nack_delay: Duration::from_secs(1),
            without_nack_on_errors: false,
            with_trace: false,
        }
    }

    pub fn without_nack_on_errors(mut self) -> Self {
        self.without_nack_on_errors = true;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.with_trace = true;
        self
    }

    pub fn with_resubscribe_interval(mut self, interval: Duration) -> Self {
        self.resubscribe_interval = interval;
        self
    }

    pub fn with_nack_delay(mut self, delay: Duration) -> Self {
        self.nack_delay = delay;
        self
    }
}

/// Durable consumer name for `subject`: `{service}_{event}_consumer`.
///
/// # Errors
///
/// [`PubSubError::InvalidSubject`] unless the subject is exactly two
/// non-empty dot-separated segments.
pub fn consumer_name(service_name: &str, subject: &str) -> Result<String, PubSubError> {
    let mut segments = subject.split('.');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(first), Some(second), None) if !first.is_empty() && !second.is_empty() => {
            Ok(format!("{service_name}_{second}_consumer"))
        }
        _ => Err(PubSubError::InvalidSubject {
            subject: subject.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
struct Binding {
    stream: String,
    subject: String,
    consumer: String,
}

#[derive(Debug, Clone, Copy)]
struct DeliveryOptions {
    nack_delay: Duration,
    without_nack_on_errors: bool,
    with_trace: bool,
}

/// Pub/sub client with background recovery of failed subscriptions.
pub struct ResilientPubSubClient<B: MessageBroker> {
    inner: Arc<Inner<B>>,
}

struct Inner<B: MessageBroker> {
    broker: B,
    config: ResilientClientConfig,
    reconnect: std::sync::Mutex<Option<ReconnectSignal>>,
    consumers: TaskTracker,
    retries: TaskTracker,
    stop_consumers: CancellationToken,
    closing: CancellationToken,
    closed: AtomicBool,
}

impl<B: MessageBroker> ResilientPubSubClient<B> {
    pub fn new(broker: B, config: ResilientClientConfig) -> Self {
        let reconnect = broker.reconnect_signal();
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                reconnect: std::sync::Mutex::new(Some(reconnect)),
                consumers: TaskTracker::new(),
                retries: TaskTracker::new(),
                stop_consumers: CancellationToken::new(),
                closing: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ResilientClientConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &B {
        &self.inner.broker
    }

    /// Number of background resubscribe tasks still pending.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.len()
    }

    /// Number of running consumer tasks.
    pub fn active_consumers(&self) -> usize {
        self.inner.consumers.len()
    }
}

#[async_trait]
impl<B: MessageBroker> PubSubClient for ResilientPubSubClient<B> {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PubSubError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::Closed);
        }

        let ack = self
            .inner
            .broker
            .publish(subject, payload.to_vec())
            .await
            .map_err(|source| {
                debug!(subject = %subject, error = %source, "failed to publish message");
                PubSubError::Publish {
                    subject: subject.to_string(),
                    source,
                }
            })?;

        info!(
            stream = %ack.stream,
            domain = ack.domain.as_deref().unwrap_or_default(),
            duplicate = ack.duplicate,
            sequence = ack.sequence,
            "publish acknowledged"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        handlers: StreamHandlers,
    ) -> Result<(), PubSubError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::Closed);
        }
        self.inner.subscribe(cancel.clone(), handlers).await
    }

    async fn close(&self) -> Result<(), PubSubError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            warn!("pub/sub client already closed");
            return Ok(());
        }

        inner.stop_consumers.cancel();
        inner.consumers.close();

        let closed_connection = inner.broker.close().await;

        inner.closing.cancel();
        inner.retries.close();
        inner.retries.wait().await;
        inner.consumers.wait().await;

        if let Ok(mut reconnect) = inner.reconnect.lock() {
            reconnect.take();
        }

        match closed_connection {
            Ok(()) => {
                info!("pub/sub client closed successfully");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to close broker connection");
                Err(PubSubError::Close(e))
            }
        }
    }
}

#[async_trait]
impl<B: MessageBroker> Publisher for ResilientPubSubClient<B> {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), PubSubError> {
        PubSubClient::publish(self, subject, payload).await
    }
}

impl<B: MessageBroker> Inner<B> {
    fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            nack_delay: self.config.nack_delay,
            without_nack_on_errors: self.config.without_nack_on_errors,
            with_trace: self.config.with_trace,
        }
    }

    fn reconnect_receiver(&self) -> Option<broadcast::Receiver<()>> {
        self.reconnect
            .lock()
            .ok()
            .and_then(|signal| signal.as_ref().map(ReconnectSignal::subscribe))
    }

    /// One subscribe pass. Boxed because retry tasks call back into it.
    fn subscribe(
        self: &Arc<Self>,
        cancel: CancellationToken,
        handlers: StreamHandlers,
    ) -> BoxFuture<'static, Result<(), PubSubError>> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            let mut plan = Vec::with_capacity(handlers.len());
            for (stream, subjects) in handlers {
                let mut bindings = Vec::with_capacity(subjects.len());
                for (subject, handler) in subjects {
                    let consumer = consumer_name(&inner.config.service_name, &subject)
                        .inspect_err(|e| debug!(error = %e, "invalid subject in subscription"))?;
                    bindings.push((
                        Binding {
                            stream: stream.clone(),
                            subject,
                            consumer,
                        },
                        handler,
                    ));
                }
                plan.push((stream, bindings));
            }

            let mut failed: StreamHandlers = HashMap::new();
            for (stream_name, bindings) in plan {
                let stream = match inner.broker.get_stream(&stream_name).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(stream = %stream_name, error = %e, "failed to get stream, deferring its subjects");
                        failed.insert(
                            stream_name,
                            bindings
                                .into_iter()
                                .map(|(binding, handler)| (binding.subject, handler))
                                .collect(),
                        );
                        continue;
                    }
                };

                for (binding, handler) in bindings {
                    match inner.start_consumer(&stream, binding.clone(), handler.clone()).await {
                        Ok(()) => info!(
                            consumer = %binding.consumer,
                            stream = %binding.stream,
                            subject = %binding.subject,
                            "consumer started"
                        ),
                        Err(e) => {
                            warn!(
                                consumer = %binding.consumer,
                                stream = %binding.stream,
                                subject = %binding.subject,
                                error = %e,
                                "failed to start consumer, deferring subject"
                            );
                            failed
                                .entry(binding.stream)
                                .or_default()
                                .insert(binding.subject, handler);
                        }
                    }
                }
            }

            inner.schedule_resubscribe(cancel, failed);
            Ok(())
        })
    }

    async fn start_consumer(
        &self,
        stream: &B::Stream,
        binding: Binding,
        handler: SubjectHandler,
    ) -> Result<(), BrokerError> {
        let consumer = stream.consumer(&binding.consumer, &binding.subject).await?;
        let mut messages = consumer.messages().await?;

        let stop = self.stop_consumers.clone();
        let options = self.delivery_options();
        self.consumers.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        debug!(consumer = %binding.consumer, "consumer stopped");
                        break;
                    }
                    next = messages.next() => match next {
                        Some(Ok(delivery)) => handle_delivery(&binding, &handler, options, delivery).await,
                        Some(Err(e)) => warn!(consumer = %binding.consumer, error = %e, "error receiving message"),
                        None => {
                            info!(consumer = %binding.consumer, "delivery stream ended");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn schedule_resubscribe(self: &Arc<Self>, cancel: CancellationToken, failed: StreamHandlers) {
        if failed.is_empty() {
            return;
        }
        let Some(mut reconnected) = self.reconnect_receiver() else {
            return;
        };
        info!(
            pending_subjects = subject_count(&failed),
            "scheduling resubscribe for failed consumers"
        );

        let inner = Arc::clone(self);
        self.retries.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stop attempts to init failed consumers, context cancelled");
                    return;
                }
                _ = inner.closing.cancelled() => {
                    info!("stop attempts to init failed consumers, client closing");
                    return;
                }
                _ = wait_for_reconnect(&mut reconnected) => {
                    debug!("reconnect signal received, resubscribing");
                }
                _ = tokio::time::sleep(inner.config.resubscribe_interval) => {
                    debug!("resubscribe interval elapsed, resubscribing");
                }
            }

            if cancel.is_cancelled() || inner.closing.is_cancelled() {
                info!("stop attempts to init failed consumers, context cancelled");
                return;
            }

            if let Err(e) = inner.subscribe(cancel, failed).await {
                error!(error = %e, "resubscribe failed");
            }
        });
    }
}

async fn wait_for_reconnect(rx: &mut broadcast::Receiver<()>) {
    match rx.recv().await {
        Ok(()) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => std::future::pending::<()>().await,
    }
}

async fn handle_delivery<D: Delivery>(
    binding: &Binding,
    handler: &SubjectHandler,
    options: DeliveryOptions,
    delivery: D,
) {
    let trace_id = if options.with_trace {
        trace_id_from_payload(delivery.payload()).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read traceId from message");
            None
        })
    } else {
        None
    };

    let span = info_span!(
        "mq_handler",
        component = %handler.component(),
        operation = %handler.operation(),
        subject = %binding.subject,
        trace_id = trace_id.as_deref().unwrap_or_default(),
    );

    let ctx = MessageContext {
        stream: binding.stream.clone(),
        subject: binding.subject.clone(),
        consumer: binding.consumer.clone(),
        component: handler.component().to_string(),
        operation: handler.operation().to_string(),
        trace_id,
    };

    async {
        match handler.handler().handle(&ctx, delivery.payload()).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(error = %e, "failed to ack message");
                }
            }
            Err(e) => {
                error!(error = %e, payload_len = delivery.payload().len(), "failed to handle message");
                if options.without_nack_on_errors {
                    return;
                }
                if let Err(e) = delivery.nak(options.nack_delay).await {
                    error!(error = %e, "failed to nack message");
                }
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_name_uses_second_segment() {
        assert_eq!(
            consumer_name("billing", "orders.created").unwrap(),
            "billing_created_consumer"
        );
    }

    #[test]
    fn test_consumer_name_rejects_malformed_subjects() {
        for subject in ["orders", "orders.created.v2", "orders.", ".created", ""] {
            let err = consumer_name("billing", subject).unwrap_err();
            assert!(err.is_structural(), "{subject} should be structural");
            assert_eq!(err.category(), ErrorCategory::Validation);
        }
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = ResilientClientConfig::new("billing");
        assert_eq!(config.resubscribe_interval, Duration::from_secs(60));
        assert_eq!(config.nack_delay, Duration::from_secs(1));
        assert!(!config.without_nack_on_errors);
        assert!(!config.with_trace);

        let config = config
            .without_nack_on_errors()
            .with_trace()
            .with_resubscribe_interval(Duration::from_secs(5))
            .with_nack_delay(Duration::from_millis(250));
        assert!(config.without_nack_on_errors);
        assert!(config.with_trace);
        assert_eq!(config.resubscribe_interval, Duration::from_secs(5));
        assert_eq!(config.nack_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_publish_error_is_retryable() {
        let err = PubSubError::Publish {
            subject: "orders.created".to_string(),
            source: BrokerError::Publish("no responders".to_string()),
        };
        assert!(!err.is_structural());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("orders.created"));
    }
}
