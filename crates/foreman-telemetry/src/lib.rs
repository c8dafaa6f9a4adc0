//! Foreman Telemetry - logging and Prometheus metrics shared by the master and workers
//!
//! The `metrics` feature (default) enables the Prometheus registry. Workers
//! build without it.

#[cfg(feature = "metrics")]
pub mod metrics;

pub mod logging;

#[cfg(feature = "metrics")]
pub use metrics::ForemanMetrics;

pub use logging::{init_logging, LogFormat, LogOutput, LoggingConfig, TaskLogContext, WorkerLogContext};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
