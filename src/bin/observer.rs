//! Observer: reclaims transactions stuck outside the happy path.

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info, warn};

use tx_orchestrator::api;
use tx_orchestrator::app::{
    AppState, FailureDigest, HandlerContext, HandlerSettings, LeaseScheduler, RetryPolicy,
    RuntimeStats, SchedulerConfig, ShutdownController, StatusHandlerRegistry, register_or_refuse,
    spawn_heartbeat,
};
use tx_orchestrator::infra::{
    EvmRpcClient, PostgresClient, PostgresConfig, PostgresQueue, PostgresQueueConfig,
    PostgresTransactionLogStore,
};
use tx_orchestrator::telemetry::init_tracing;

const ROLE: &str = "observer";

#[derive(Debug, Parser)]
#[command(name = "observer", version, about = "Lease-based recovery scheduler")]
struct Cli {
    /// Unique id of this observer process
    #[arg(long)]
    process_id: i32,

    /// Most rows claimed per tick
    #[arg(long)]
    prefetch_count: Option<i64>,
}

/// Application configuration
struct Config {
    database_url: String,
    status_addr: Option<SocketAddr>,
    scheduler: SchedulerConfig,
    retry: RetryPolicy,
    handlers: HandlerSettings,
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

        Ok(Self {
            database_url,
            status_addr,
            scheduler: SchedulerConfig::from_env(cli.process_id, cli.prefetch_count),
            retry: RetryPolicy::from_env(),
            handlers: HandlerSettings::from_env(),
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
        error!(error = ?e, "Observer failed");
    }
    // Non-zero even after a clean drain; the supervisor restarts the process
    ExitCode::FAILURE
}

async fn run(cli: Cli) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = cli.process_id,
        "Starting observer"
    );
    let config = Config::from_env(&cli)?;

    let postgres = PostgresClient::new(&config.database_url, PostgresConfig::default())
        .await
        .context("Failed to connect to PostgreSQL")?;
    postgres
        .run_migrations()
        .await
        .context("Failed to apply migrations")?;
    let pool = postgres.pool().clone();
    let postgres = Arc::new(postgres);

    register_or_refuse(
        postgres.as_ref(),
        ROLE,
        cli.process_id,
        config.scheduler.tick_interval,
    )
    .await
    .context("Process registration refused")?;

    let chain = EvmRpcClient::from_env().context("Failed to configure chain RPC")?;
    let publisher = PostgresQueue::new(
        pool.clone(),
        PostgresQueueConfig::new(tx_orchestrator::app::consumer::DEFAULT_QUEUE)
            .with_env_overrides(),
    );

    let digest = Arc::new(FailureDigest::new());
    let ctx = HandlerContext {
        store: postgres.clone(),
        tx_log: Arc::new(PostgresTransactionLogStore::new(pool)),
        chain: Arc::new(chain),
        publisher: Arc::new(publisher),
        retry: config.retry,
        digest: Arc::clone(&digest),
        settings: config.handlers,
    };
    let registry = StatusHandlerRegistry::standard(ctx);
    let scheduler = LeaseScheduler::new(
        config.scheduler.clone(),
        postgres.clone(),
        registry,
        config.retry,
        digest,
    );

    let shutdown = ShutdownController::new();
    let signals = shutdown.listen_for_signals();
    let heartbeat = spawn_heartbeat(
        postgres.clone(),
        ROLE,
        cli.process_id,
        config.scheduler.tick_interval,
        shutdown.clone(),
    );

    if let Some(addr) = config.status_addr {
        let state = Arc::new(AppState::new(
            postgres.clone(),
            cli.process_id,
            RuntimeStats::Observer(scheduler.stats()),
            shutdown.clone(),
        ));
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, addr, server_shutdown).await {
                warn!(error = %e, "Status server stopped");
            }
        });
    }

    scheduler.run(shutdown.clone()).await;

    if let Some(reason) = shutdown.reason() {
        info!(reason = %reason, "Observer shut down");
    }
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task ended abnormally");
    }
    signals.abort();
    Ok(())
}
