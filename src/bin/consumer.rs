//! Queue consumer: executes transactions from the broker with bounded concurrency.

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info, warn};

use tx_orchestrator::api;
use tx_orchestrator::app::{
    AppState, BoundedQueueConsumer, ConsumerConfig, DrainOutcome, ExecuteTransactionHandler,
    FailureDigest, RuntimeStats, ShutdownController, register_or_refuse, spawn_heartbeat,
};
use tx_orchestrator::infra::{
    EvmRpcClient, PostgresClient, PostgresConfig, PostgresQueue, PostgresQueueConfig,
    PostgresTransactionLogStore,
};
use tx_orchestrator::telemetry::init_tracing;

const ROLE: &str = "consumer";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Parser)]
#[command(name = "consumer", version, about = "Bounded queue consumer for execute messages")]
struct Cli {
    /// Unique id of this consumer process
    process_id: i32,

    /// Consume the slow queue with its smaller prefetch
    #[arg(long)]
    slow_processor: bool,
}

/// Application configuration
struct Config {
    database_url: String,
    status_addr: Option<SocketAddr>,
    consumer: ConsumerConfig,
    submitted_grace_secs: i64,
}

impl Config {
    fn from_env(cli: &Cli) -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let status_addr = env::var("STATUS_PORT")
            .ok()
            .map(|port| {
                port.parse::<u16>()
                    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
                    .with_context(|| format!("Invalid STATUS_PORT '{}'", port))
            })
            .transpose()?;
        let submitted_grace_secs = env::var("SUBMITTED_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            database_url,
            status_addr,
            consumer: ConsumerConfig::from_env(cli.slow_processor),
            submitted_grace_secs,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    dotenv().ok();
    init_tracing();

    if let Err(e) = run(cli).await {
        error!(error = ?e, "Consumer failed");
    }
    ExitCode::FAILURE
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = cli.process_id,
        queue = %config.consumer.queue,
        prefetch = config.consumer.prefetch,
        "Starting consumer"
    );

    let postgres = PostgresClient::new(&config.database_url, PostgresConfig::default())
        .await
        .context("Failed to connect to PostgreSQL")?;
    postgres
        .run_migrations()
        .await
        .context("Failed to apply migrations")?;
    let pool = postgres.pool().clone();
    let postgres = Arc::new(postgres);

    register_or_refuse(postgres.as_ref(), ROLE, cli.process_id, HEARTBEAT_INTERVAL)
        .await
        .context("Process registration refused")?;

    let chain = EvmRpcClient::from_env().context("Failed to configure chain RPC")?;
    let handler = ExecuteTransactionHandler::new(
        postgres.clone(),
        Arc::new(PostgresTransactionLogStore::new(pool.clone())),
        Arc::new(chain),
        config.submitted_grace_secs,
    );
    let source = PostgresQueue::new(
        pool,
        PostgresQueueConfig::new(config.consumer.queue.clone()).with_env_overrides(),
    );

    let shutdown = ShutdownController::new();
    let signals = shutdown.listen_for_signals();
    let heartbeat = spawn_heartbeat(
        postgres.clone(),
        ROLE,
        cli.process_id,
        HEARTBEAT_INTERVAL,
        shutdown.clone(),
    );

    let consumer = BoundedQueueConsumer::new(
        config.consumer.clone(),
        Arc::new(source),
        Arc::new(handler),
        Arc::new(FailureDigest::new()),
        shutdown.clone(),
    );

    if let Some(addr) = config.status_addr {
        let state = Arc::new(AppState::new(
            postgres.clone(),
            cli.process_id,
            RuntimeStats::Consumer(consumer.state()),
            shutdown.clone(),
        ));
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, addr, server_shutdown).await {
                warn!(error = %e, "Status server stopped");
            }
        });
    }

    match consumer.run().await {
        DrainOutcome::Drained => info!("Consumer drained"),
        DrainOutcome::TimedOut { remaining } => {
            warn!(remaining, "Consumer exiting with deliveries in flight")
        }
    }
    if let Some(reason) = shutdown.reason() {
        info!(reason = %reason, "Consumer shut down");
    }
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task ended abnormally");
    }
    signals.abort();
    Ok(())
}
