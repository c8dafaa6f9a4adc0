//! Foreman Master - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use foreman_broker::{BrokerClient, RedisBroker, RedisBrokerConfig};
use foreman_core::{ForemanConfig, WorkerRunOptions};
use foreman_master::shutdown::install_shutdown_handler;
use foreman_master::{
    ManagementServer, PoolConfig, ProcessLauncher, Scheduler, SchedulerConfig, WorkerPool,
};
use foreman_telemetry::LoggingConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Foreman Master - runs tenant tasks in a pool of worker processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL
    #[arg(long, env = "FOREMAN_BROKER_URL")]
    broker_url: Option<String>,

    /// Maximum number of busy workers
    #[arg(long)]
    concurrent: Option<usize>,

    /// Management server port
    #[arg(long)]
    management_port: Option<u16>,

    /// Worker executable
    #[arg(long, env = "FOREMAN_WORKER_BINARY")]
    worker_binary: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ForemanConfig::load(args.config.as_ref())?;

    // Override with CLI args
    if let Some(broker_url) = args.broker_url {
        config.broker.url = broker_url;
    }
    if let Some(concurrent) = args.concurrent {
        config.workers.concurrent = Some(concurrent);
    }
    if let Some(port) = args.management_port {
        config.management.port = Some(port);
    }
    if let Some(binary) = args.worker_binary {
        config.workers.worker_binary = Some(binary);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    foreman_telemetry::init_logging(LoggingConfig::new(
        config.logging.level.clone(),
        &config.logging.format,
    )?)?;

    #[cfg(feature = "metrics")]
    foreman_telemetry::ForemanMetrics::new()?;

    info!("Starting Foreman Master v{}", env!("CARGO_PKG_VERSION"));
    info!("Broker: {}", config.broker.url);

    let shutdown = install_shutdown_handler();

    let broker = RedisBroker::with_config(RedisBrokerConfig::from_config(&config.broker, 2))
        .await
        .context("unable to connect to the broker")?;
    let client = BrokerClient::new(Arc::new(broker), config.compression.clone());

    let binary = config
        .workers
        .worker_binary
        .clone()
        .unwrap_or_else(ProcessLauncher::default_binary);
    info!("Worker binary: {}", binary.display());
    let launcher = ProcessLauncher::new(binary, &WorkerRunOptions::from_config(&config))?;

    let (pool, notices) = WorkerPool::new(PoolConfig::from_workers(&config.workers), Arc::new(launcher));

    if let Some(addr) = config.management.addr() {
        let server = ManagementServer::bind(&addr, Arc::clone(&pool))
            .await
            .with_context(|| format!("unable to bind the management server to {}", addr))?;
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(token).await {
                error!("Management server failed: {}", e);
            }
        });
    }

    let scheduler = Scheduler::new(
        SchedulerConfig::from_config(&config),
        client,
        pool,
        shutdown.clone(),
    );

    info!("Foreman Master ready");
    let outcome = scheduler.run(notices).await;

    // stops the management server if the scheduler quit on its own
    shutdown.cancel();

    outcome?;
    info!("Foreman Master stopped");
    Ok(())
}
