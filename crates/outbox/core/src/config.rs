//! Configuration loading
//!
//! Every component config has a `Default` and a `from_env()` constructor.
//! [`ConfigLoader`] optionally loads a `.env` file first.
//!
//! # Environment Variables
//!
//! - `OUTBOX_SERVICE_NAME` (required): service identity used in consumer names
//! - `OUTBOX_PUBLISHER_STRATEGY`: `polling` (default) or `job-queue`
//! - `OUTBOX_PUBLISH_INTERVAL_MS` (1000), `OUTBOX_PUBLISH_BATCH_SIZE` (100)
//! - `OUTBOX_NATS_RESUBSCRIBE_SECS` (60), `OUTBOX_NATS_NACK_DELAY_MS` (1000),
//!   `OUTBOX_NATS_WITHOUT_NACK` (0), `OUTBOX_NATS_WITH_TRACE` (0)
//! - `OUTBOX_JOB_QUEUE_NAMES` (`default`), `OUTBOX_JOB_MAX_ATTEMPTS` (5),
//!   `OUTBOX_JOB_MAX_WORKERS` (10), `OUTBOX_JOB_<QUEUE>_MAX_WORKERS`,
//!   `OUTBOX_JOB_NEXT_RETRY_SECS` (30), `OUTBOX_JOB_TIMEOUT_SECS` (30),
//!   `OUTBOX_JOB_FETCH_COOLDOWN_MS` (5000), `OUTBOX_JOB_FETCH_POLL_INTERVAL_MS` (10000)
//! - `OUTBOX_SHUTDOWN_TIMEOUT_SECS` (30)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::job::{JobQueueConfig, QueueConfig, RetryPolicy};
use crate::publisher::PollingPublisherConfig;
use crate::pubsub::ResilientClientConfig;
use crate::shutdown::ShutdownConfig;

/// Errors that can occur during configuration loading or validation
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required configuration variable is missing
    #[error("Missing required configuration: {var}")]
    MissingRequired { var: String },

    /// A configuration variable has an invalid value
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    /// Failed to load .env file
    #[error("Failed to load .env file from {path}: {source}")]
    EnvFileLoad {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Loads an optional `.env` file, then builds configuration from the environment.
///
/// Variables already present in the process environment win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    pub fn env_file_path(&self) -> Option<&Path> {
        self.env_file_path.as_deref()
    }

    /// Loads the `.env` file (if any) and runs `build`.
    pub fn load<T>(&self, build: impl FnOnce() -> ConfigResult<T>) -> ConfigResult<T> {
        if let Some(path) = &self.env_file_path {
            load_env_file(path)?;
        }
        build()
    }
}

fn load_env_file(path: &Path) -> ConfigResult<()> {
    if !path.exists() {
        return Err(ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source: dotenv::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {}", path.display()),
            )),
        });
    }

    dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Reads a required, non-empty variable.
pub fn require_var(var: &str) -> ConfigResult<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            var: var.to_string(),
        })
}

/// Parses `var` when set; `default` when unset or empty.
///
/// # Errors
///
/// [`ConfigError::InvalidValue`] when the value does not parse.
pub fn parse_optional_var<T>(var: &str, default: T) -> ConfigResult<T>
where
    T: FromStr,
{
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    var: var.to_string(),
                    value,
                })
        }
        _ => Ok(default),
    }
}

/// Like [`parse_optional_var`] but zero falls back to `default`.
pub fn parse_positive_var<T>(var: &str, default: T) -> ConfigResult<T>
where
    T: FromStr + PartialEq + Default + Copy,
{
    let value = parse_optional_var(var, default)?;
    if value == T::default() {
        Ok(default)
    } else {
        Ok(value)
    }
}

/// `0`/`1` flag.
pub fn parse_flag(var: &str, default: bool) -> ConfigResult<bool> {
    match parse_optional_var::<u8>(var, u8::from(default))? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: "must be 0 or 1".to_string(),
        }),
    }
}

/// How outbox messages reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublisherStrategy {
    /// Self-timed polling loop.
    #[default]
    Polling,
    /// One job per message on the durable job queue.
    JobQueue,
}

impl FromStr for PublisherStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" => Ok(PublisherStrategy::Polling),
            "job-queue" | "job_queue" | "jobqueue" => Ok(PublisherStrategy::JobQueue),
            other => Err(ConfigError::InvalidValue {
                var: "OUTBOX_PUBLISHER_STRATEGY".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PublisherStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublisherStrategy::Polling => f.write_str("polling"),
            PublisherStrategy::JobQueue => f.write_str("job-queue"),
        }
    }
}

impl PublisherStrategy {
    pub fn from_env() -> ConfigResult<Self> {
        match std::env::var("OUTBOX_PUBLISHER_STRATEGY") {
            Ok(value) if !value.trim().is_empty() => value.parse(),
            _ => Ok(Self::default()),
        }
    }
}

impl PollingPublisherConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();
        let interval_ms = parse_positive_var(
            "OUTBOX_PUBLISH_INTERVAL_MS",
            defaults.interval.as_millis() as u64,
        )?;
        let batch_size = parse_positive_var("OUTBOX_PUBLISH_BATCH_SIZE", defaults.batch_size)?;

        Ok(Self {
            interval: Duration::from_millis(interval_ms),
            batch_size,
        })
    }
}

impl ResilientClientConfig {
    /// Requires `OUTBOX_SERVICE_NAME`.
    pub fn from_env() -> ConfigResult<Self> {
        let service_name = require_var("OUTBOX_SERVICE_NAME")?;
        let defaults = Self::new(service_name);

        let resubscribe_secs = parse_positive_var(
            "OUTBOX_NATS_RESUBSCRIBE_SECS",
            defaults.resubscribe_interval.as_secs(),
        )?;
        let nack_delay_ms = parse_positive_var(
            "OUTBOX_NATS_NACK_DELAY_MS",
            defaults.nack_delay.as_millis() as u64,
        )?;

        Ok(Self {
            resubscribe_interval: Duration::from_secs(resubscribe_secs),
            nack_delay: Duration::from_millis(nack_delay_ms),
            without_nack_on_errors: parse_flag("OUTBOX_NATS_WITHOUT_NACK", false)?,
            with_trace: parse_flag("OUTBOX_NATS_WITH_TRACE", false)?,
            ..defaults
        })
    }
}

impl JobQueueConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();

        let names = std::env::var("OUTBOX_JOB_QUEUE_NAMES").unwrap_or_default();
        let mut names: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            names = defaults.queues.iter().map(|q| q.name.clone()).collect();
        }

        let max_workers = parse_positive_var("OUTBOX_JOB_MAX_WORKERS", 10usize)?;
        let queues = names
            .into_iter()
            .map(|name| {
                let var = format!("OUTBOX_JOB_{}_MAX_WORKERS", env_key(&name));
                let workers = parse_positive_var(&var, max_workers)?;
                Ok(QueueConfig::new(name, workers))
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let next_retry_secs = parse_positive_var("OUTBOX_JOB_NEXT_RETRY_SECS", 30u64)?;
        let timeout_secs =
            parse_positive_var("OUTBOX_JOB_TIMEOUT_SECS", defaults.job_timeout.as_secs())?;
        let cooldown_ms = parse_positive_var(
            "OUTBOX_JOB_FETCH_COOLDOWN_MS",
            defaults.fetch_cooldown.as_millis() as u64,
        )?;
        let poll_ms = parse_positive_var(
            "OUTBOX_JOB_FETCH_POLL_INTERVAL_MS",
            defaults.fetch_poll_interval.as_millis() as u64,
        )?;

        let config = Self {
            queues,
            max_attempts: parse_positive_var("OUTBOX_JOB_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_policy: RetryPolicy::Fixed(Duration::from_secs(next_retry_secs)),
            job_timeout: Duration::from_secs(timeout_secs),
            fetch_cooldown: Duration::from_millis(cooldown_ms),
            fetch_poll_interval: Duration::from_millis(poll_ms),
        };
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }
}

impl ShutdownConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();
        let timeout_secs =
            parse_positive_var("OUTBOX_SHUTDOWN_TIMEOUT_SECS", defaults.timeout.as_secs())?;
        Ok(defaults.with_timeout(Duration::from_secs(timeout_secs)))
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
