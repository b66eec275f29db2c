//! Relay configuration, assembled from the component configs.

use outbox_core::config::{ConfigResult, PublisherStrategy, parse_optional_var};
use outbox_core::job::JobQueueConfig;
use outbox_core::publisher::PollingPublisherConfig;
use outbox_core::pubsub::ResilientClientConfig;
use outbox_core::shutdown::ShutdownConfig;
use outbox_nats::NatsConfig;
use outbox_pg::DatabaseConfig;

/// Log output format (`OUTBOX_LOG_FORMAT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> ConfigResult<Self> {
        let format = parse_optional_var("OUTBOX_LOG_FORMAT", String::from("text"))?;
        Ok(if format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        })
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub client: ResilientClientConfig,
    pub strategy: PublisherStrategy,
    pub polling: PollingPublisherConfig,
    pub jobs: JobQueueConfig,
    pub shutdown: ShutdownConfig,
}

impl RelayConfig {
    /// Only the settings of the selected strategy are read.
    pub fn from_env() -> ConfigResult<Self> {
        let strategy = PublisherStrategy::from_env()?;
        let (polling, jobs) = match strategy {
            PublisherStrategy::Polling => {
                (PollingPublisherConfig::from_env()?, JobQueueConfig::default())
            }
            PublisherStrategy::JobQueue => {
                (PollingPublisherConfig::default(), JobQueueConfig::from_env()?)
            }
        };

        Ok(Self {
            database: DatabaseConfig::from_env()?,
            nats: NatsConfig::from_env()?,
            client: ResilientClientConfig::from_env()?,
            strategy,
            polling,
            jobs,
            shutdown: ShutdownConfig::from_env()?,
        })
    }
}
