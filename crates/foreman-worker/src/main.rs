//! Foreman Worker - Main entry point
//!
//! Started by the master; talks to it over stdin/stdout and logs to stderr.

use anyhow::Result;
use clap::Parser;
use foreman_core::WorkerRunOptions;
use foreman_telemetry::LoggingConfig;
use foreman_worker::{
    Dispatcher, EchoService, FailService, NoSandbox, SleepService, StaticModel, StaticModelLoader,
    WorkerRuntime,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Foreman Worker - runs one task at a time on behalf of the master
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory of tenant code (overrides the master's run options)
    #[arg(long, env = "FOREMAN_REPO_PATH")]
    repo_path: Option<PathBuf>,

    /// Log level (overrides the master's run options)
    #[arg(long, env = "FOREMAN_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut options = WorkerRunOptions::from_env()?;
    if let Some(repo_path) = args.repo_path {
        options.repo_path = repo_path;
    }
    if let Some(log_level) = args.log_level {
        options.log_level = log_level;
    }

    // stdout carries IPC, so logs go to stderr
    foreman_telemetry::init_logging(
        LoggingConfig::new(options.log_level.clone(), &options.log_format)?.to_stderr(),
    )?;

    ignore_termination_signals();

    let mut model = StaticModel::new();
    model
        .register_service(Arc::new(EchoService))
        .register_service(Arc::new(SleepService))
        .register_service(Arc::new(FailService));

    info!("Registered built-in services: echo, sleep, fail");

    let heartbeat = options.heartbeat_interval();
    let dispatcher = Dispatcher::new(
        options,
        Arc::new(StaticModelLoader::new(model)),
        Arc::new(NoSandbox),
    );

    WorkerRuntime::new(tokio::io::stdin(), tokio::io::stdout(), dispatcher, heartbeat)
        .run()
        .await?;

    Ok(())
}

/// The master owns the worker's lifetime and kills it when needed
#[cfg(unix)]
fn ignore_termination_signals() {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        tracing::debug!("Ignoring termination signal {:?}", kind);
                    }
                });
            }
            Err(e) => tracing::warn!("Unable to install signal handler: {}", e),
        }
    }
}

#[cfg(not(unix))]
fn ignore_termination_signals() {}
