//! Outbox Relay
//!
//! Drains the transactional outbox from PostgreSQL into NATS JetStream using
//! the configured publisher strategy, until SIGINT/SIGTERM.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use outbox_core::config::{ConfigLoader, PublisherStrategy};
use outbox_core::job::JobQueueClient;
use outbox_core::publisher::{OutboxJobWorker, PollingOutboxPublisher};
use outbox_core::pubsub::{PubSubClient, ResilientPubSubClient};
use outbox_core::shutdown::ShutdownCoordinator;
use outbox_nats::JetStreamBroker;
use outbox_pg::{DatabaseConfig, OutboxRepositoryConfig, PostgresJobStore, PostgresOutboxRepository};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::{LogFormat, RelayConfig};

/// CLI arguments for outbox-relay
#[derive(Parser, Debug)]
#[command(name = "outbox-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transactional outbox relay", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// .env file loaded before reading configuration
    #[arg(long, env = "OUTBOX_ENV_FILE", global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the relay (default)
    Run,
    /// Create the outbox and job tables, then exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let loader = ConfigLoader::new(args.env_file.clone());

    let log_format = loader.load(LogFormat::from_env)?;
    setup_logging(args.debug, log_format)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Migrate => migrate(&loader).await,
        Command::Run => run(loader.load(RelayConfig::from_env)?).await,
    }
}

/// Setup logging based on debug flag and output format.
fn setup_logging(debug: bool, format: LogFormat) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))
}

async fn migrate(loader: &ConfigLoader) -> anyhow::Result<()> {
    let database = loader.load(DatabaseConfig::from_env)?;
    let pool = database.connect().await.context("connecting to PostgreSQL")?;
    outbox_pg::migrate(&pool).await.context("running migrations")?;
    pool.close().await;
    Ok(())
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    info!(
        strategy = %config.strategy,
        service = %config.client.service_name,
        "starting outbox relay"
    );

    let coordinator = ShutdownCoordinator::new(config.shutdown.clone());
    coordinator.start_signal_handler();

    let pool = config
        .database
        .connect()
        .await
        .context("connecting to PostgreSQL")?;
    coordinator.add("postgres", {
        let pool = pool.clone();
        move || async move {
            pool.close().await;
            Ok::<_, std::convert::Infallible>(())
        }
    });

    let broker = JetStreamBroker::connect(&config.nats)
        .await
        .context("connecting to NATS")?;
    let client = Arc::new(ResilientPubSubClient::new(broker, config.client.clone()));
    coordinator.add("pubsub", {
        let client = Arc::clone(&client);
        move || async move { client.close().await }
    });

    let repository = Arc::new(PostgresOutboxRepository::with_config(
        pool.clone(),
        OutboxRepositoryConfig {
            claim_rows: config.database.claim_rows,
            claim_lease: config.database.claim_lease(),
        },
    ));

    let token = coordinator.token();
    let worker = match config.strategy {
        PublisherStrategy::Polling => {
            let publisher =
                PollingOutboxPublisher::new(repository, Arc::clone(&client), config.polling);
            tokio::spawn(run_until_cancelled(token, move |cancel| async move {
                publisher.run(cancel).await;
                Ok(())
            }))
        }
        PublisherStrategy::JobQueue => {
            let mut jobs =
                JobQueueClient::new(Arc::new(PostgresJobStore::new(pool.clone())), config.jobs);
            jobs.add_worker(OutboxJobWorker::new(repository, Arc::clone(&client)));
            tokio::spawn(run_until_cancelled(token, move |cancel| async move {
                jobs.run(cancel).await.map_err(anyhow::Error::from)
            }))
        }
    };

    let reason = coordinator.wait_for_signal().await;
    info!(reason = %reason, "shutting down outbox relay");

    let worker_result = match worker.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("publisher task failed: {e}")),
    };

    let report = coordinator.close_all().await;
    for e in &report.errors {
        error!(error = %e, "shutdown error");
    }

    worker_result?;
    if !report.is_clean() {
        anyhow::bail!("{} component(s) did not shut down cleanly", report.errors.len());
    }
    Ok(())
}

/// Runs a publisher until `cancel` fires. A publisher that stops on its own
/// cancels the token so the relay shuts down.
async fn run_until_cancelled<F, Fut>(cancel: CancellationToken, work: F) -> anyhow::Result<()>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let result = work(cancel.clone()).await;
    if !cancel.is_cancelled() {
        match &result {
            Ok(()) => error!("publisher stopped unexpectedly"),
            Err(e) => error!(error = %e, "publisher failed"),
        }
        cancel.cancel();
    }
    result
}
