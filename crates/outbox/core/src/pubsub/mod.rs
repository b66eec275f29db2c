//! Resilient publish/subscribe over a JetStream-like broker.

pub mod broker;
pub mod client;
pub mod handler;

pub use broker::{
    BrokerConsumer, BrokerError, BrokerStream, Delivery, DeliveryStream, MessageBroker,
    PublishAck, ReconnectSignal,
};
pub use client::{
    PubSubClient, PubSubError, ResilientClientConfig, ResilientPubSubClient, consumer_name,
};
pub use handler::{
    FnHandler, HandlerError, MessageContext, MessageHandler, StreamHandlers, SubjectHandler,
    SubjectHandlers, handler_fn, subject_count,
};
