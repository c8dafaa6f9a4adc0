//! Structured logging for Foreman
//!
//! The master logs to stdout. Workers log to stderr because their stdout
//! carries the IPC channel. `RUST_LOG` takes precedence over the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, time::UtcTime, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::{TelemetryError, TelemetryResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "foreman_master=debug")
    pub level: String,

    pub format: LogFormat,

    pub output: LogOutput,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, multi-line)
    Pretty,
    /// Compact format (single line)
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" | "text" => Ok(LogFormat::Compact),
            other => Err(TelemetryError::Config(format!("Unknown log format: {}", other))),
        }
    }
}

/// Log destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
        }
    }
}

impl LoggingConfig {
    /// Build from a level and a format name
    pub fn new(level: impl Into<String>, format: &str) -> TelemetryResult<Self> {
        Ok(Self {
            level: level.into(),
            format: format.parse()?,
            ..Default::default()
        })
    }

    /// Send log lines to stderr
    pub fn to_stderr(mut self) -> Self {
        self.output = LogOutput::Stderr;
        self
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer(config: &LoggingConfig) -> BoxedLayer {
    let writer = match config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
    };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer
            .compact()
            .with_ansi(config.output == LogOutput::Stdout)
            .boxed(),
    }
}

/// Initialize logging with configuration
pub fn init_logging(config: LoggingConfig) -> TelemetryResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing_subscriber::registry()
        .with(format_layer(&config))
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::Logging(e.to_string()))?;

    tracing::debug!(
        "Logging initialized with level: {}, format: {:?}",
        config.level,
        config.format
    );

    Ok(())
}

/// Log context for a task on its way through the master or a worker
#[derive(Debug, Clone)]
pub struct TaskLogContext {
    pub task_id: String,
    pub kind: String,
    pub application_id: String,
}

impl TaskLogContext {
    /// Create a new task log context
    pub fn new(task_id: &str, kind: &str, application_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            application_id: application_id.to_string(),
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "task",
            task_id = %self.task_id,
            kind = %self.kind,
            app = %self.application_id
        )
    }
}

/// Worker log context
#[derive(Debug, Clone)]
pub struct WorkerLogContext {
    pub worker_id: String,
    pub pid: Option<u32>,
}

impl WorkerLogContext {
    /// Create a new worker log context
    pub fn new(worker_id: &str, pid: Option<u32>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            pid,
        }
    }

    /// Create a tracing span with this context
    pub fn span(&self) -> tracing::Span {
        match self.pid {
            Some(pid) => tracing::info_span!("worker", worker_id = %self.worker_id, pid = pid),
            None => tracing::info_span!("worker", worker_id = %self.worker_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_config_to_stderr() {
        let config = LoggingConfig::new("debug", "pretty").unwrap().to_stderr();
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.output, LogOutput::Stderr);
    }
}
