//! NATS connection configuration.

use std::time::Duration;

use outbox_core::config::{
    ConfigResult, parse_flag, parse_optional_var, parse_positive_var, require_var,
};

/// NATS JetStream connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    /// Server URL, or a comma-separated list of URLs
    pub url: String,
    /// Connection name reported to the server
    pub client_name: Option<String>,
    /// Timeout of each connection attempt (seconds)
    pub connection_timeout_secs: u64,
    /// Create missing durable consumers instead of failing the subscription
    pub create_consumers: bool,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: None,
            connection_timeout_secs: 5,
            create_consumers: false,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_create_consumers(mut self) -> Self {
        self.create_consumers = true;
        self
    }

    /// # Required Variables
    ///
    /// - `OUTBOX_NATS_URL`
    ///
    /// # Optional Variables
    ///
    /// - `OUTBOX_NATS_CLIENT_NAME`
    /// - `OUTBOX_NATS_CONNECT_TIMEOUT_SECS` (default: 5)
    /// - `OUTBOX_NATS_CREATE_CONSUMERS` "1"=on (default: 0)
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::new(require_var("OUTBOX_NATS_URL")?);
        let client_name = parse_optional_var("OUTBOX_NATS_CLIENT_NAME", String::new())?;
        Ok(Self {
            client_name: Some(client_name).filter(|name| !name.is_empty()),
            connection_timeout_secs: parse_positive_var(
                "OUTBOX_NATS_CONNECT_TIMEOUT_SECS",
                defaults.connection_timeout_secs,
            )?,
            create_consumers: parse_flag("OUTBOX_NATS_CREATE_CONSUMERS", defaults.create_consumers)?,
            ..defaults
        })
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}
