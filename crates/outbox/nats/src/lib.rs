//! # Outbox NATS
//!
//! JetStream adapter for the resilient pub/sub client in `outbox-core`.
//!
//! ```ignore
//! let broker = JetStreamBroker::connect(&NatsConfig::from_env()?).await?;
//! let client = ResilientPubSubClient::new(broker, ResilientClientConfig::from_env()?);
//! ```

pub mod broker;
pub mod config;

pub use broker::{JetStreamBroker, JetStreamConsumer, JetStreamDelivery, JetStreamStream};
pub use config::NatsConfig;
