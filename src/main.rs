//! Status Page Poller Binary

use clap::Parser;
use status_poller::{Config, Result, StatusPoller};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Polls the status page services and maintains incidents and metrics
#[derive(Debug, Parser)]
#[command(name = "status_poller", version)]
struct Cli {
    /// Run a single cycle, print its report as JSON and exit
    #[arg(long)]
    once: bool,

    /// Seconds between cycles (overrides POLL_INTERVAL_SECONDS)
    #[arg(long)]
    interval: Option<u64>,

    /// MySQL connection string (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing
    initialize_tracing();

    info!("Starting status poller v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = Config::from_env();
    if let Some(seconds) = cli.interval {
        config.poll_interval = Duration::from_secs(seconds);
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = Some(database_url);
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Poller configuration - Interval: {}s, HTTP timeout: {}s, Cooldown: {}s, Concurrency: {}",
        config.poll_interval.as_secs(),
        config.http_timeout.as_secs(),
        config.cooldown_secs,
        config.max_concurrent_probes
    );

    let poller = StatusPoller::connect(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to wait for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    if cli.once {
        let report = poller.run_cycle(shutdown_rx).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Err(e) = poller.run(shutdown_rx).await {
        error!("Poller failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
