//! Configuration structures for Foreman

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the worker run options as JSON
pub const RUN_OPTIONS_ENV: &str = "FOREMAN_RUN_OPTIONS";

/// Main configuration for the master process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Envelope compression
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Management HTTP server
    #[serde(default)]
    pub management: ManagementConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Session liveness key
    #[serde(default)]
    pub session: SessionConfig,

    /// Root directory holding one code directory per tenant
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,

    /// Apply the sandbox inside workers
    #[serde(default)]
    pub sandbox: bool,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from("repo")
}

impl ForemanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Configuration(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from an optional file, then let environment variables take precedence
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Override fields from `FOREMAN_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("FOREMAN_BROKER_URL") {
            self.broker.url = url;
        }
        if let Ok(concurrent) = std::env::var("FOREMAN_WORKERS_CONCURRENT") {
            self.workers.concurrent = Some(parse_env("FOREMAN_WORKERS_CONCURRENT", &concurrent)?);
        }
        if let Ok(cache) = std::env::var("FOREMAN_WORKERS_CACHE") {
            self.workers.cache = cache
                .parse()
                .map_err(|e| crate::Error::Configuration(format!("FOREMAN_WORKERS_CACHE: {}", e)))?;
        }
        if let Ok(threshold) = std::env::var("FOREMAN_LOW_PRIORITY_THRESHOLD") {
            self.workers.low_priority_threshold =
                Some(parse_env("FOREMAN_LOW_PRIORITY_THRESHOLD", &threshold)?);
        }
        if let Ok(port) = std::env::var("FOREMAN_MANAGEMENT_PORT") {
            self.management.port = Some(parse_env("FOREMAN_MANAGEMENT_PORT", &port)?);
        }
        if let Ok(path) = std::env::var("FOREMAN_REPO_PATH") {
            self.repo_path = PathBuf::from(path);
        }
        if let Ok(enabled) = std::env::var("FOREMAN_COMPRESSION") {
            self.compression.enabled = parse_env("FOREMAN_COMPRESSION", &enabled)?;
        }
        if let Ok(level) = std::env::var("FOREMAN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FOREMAN_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers.concurrent == Some(0) {
            return Err(crate::Error::Configuration(
                "workers.concurrent must be greater than zero".to_string(),
            ));
        }
        if let Some(threshold) = self.workers.low_priority_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(crate::Error::Configuration(format!(
                    "workers.low_priority_threshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }
        if self.workers.status.warning > self.workers.status.critical {
            return Err(crate::Error::Configuration(
                "workers.status.warning must not exceed workers.status.critical".to_string(),
            ));
        }
        if self.compression.level > 9 {
            return Err(crate::Error::Configuration(format!(
                "compression.level must be within [0, 9], got {}",
                self.compression.level
            )));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Configuration(format!("{}: {}", name, e)))
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Connection URL
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Primary tasks channel
    #[serde(default = "default_tasks_channel")]
    pub tasks_channel: String,

    /// Low-priority tasks channel
    #[serde(default = "default_low_priority_channel")]
    pub low_priority_channel: String,

    /// Pub/sub channel carrying control commands
    #[serde(default = "default_control_channel")]
    pub control_channel: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
}

fn default_broker_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_tasks_channel() -> String {
    "CODE_RUNNER_DRIVER".to_string()
}

fn default_low_priority_channel() -> String {
    "JS_CR_QUEUE_LP".to_string()
}

fn default_control_channel() -> String {
    "SERVICE_QUEUE_P_CR".to_string()
}

fn default_connection_timeout() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            tasks_channel: default_tasks_channel(),
            low_priority_channel: default_low_priority_channel(),
            control_channel: default_control_channel(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

/// Worker cache setting: `true` caches up to four workers per slot, a number sets the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheSetting {
    Enabled(bool),
    Limit(usize),
}

impl Default for CacheSetting {
    fn default() -> Self {
        CacheSetting::Enabled(true)
    }
}

impl CacheSetting {
    /// Maximum number of cached workers for the given pool ceiling
    pub fn limit(&self, ceiling: usize) -> usize {
        match self {
            CacheSetting::Enabled(true) => 4 * ceiling,
            CacheSetting::Enabled(false) => 0,
            CacheSetting::Limit(limit) => *limit,
        }
    }
}

impl std::str::FromStr for CacheSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "true" => Ok(CacheSetting::Enabled(true)),
            "false" => Ok(CacheSetting::Enabled(false)),
            other => other
                .parse()
                .map(CacheSetting::Limit)
                .map_err(|_| format!("Invalid cache setting: {}", s)),
        }
    }
}

/// Heartbeat configuration, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often workers report liveness
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,

    /// Silence after which a worker is killed
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout: u64,
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    30
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Load thresholds for the pool health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusThresholds {
    #[serde(default = "default_warning_threshold")]
    pub warning: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical: f64,
}

fn default_warning_threshold() -> f64 {
    0.7
}

fn default_critical_threshold() -> f64 {
    0.9
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            warning: default_warning_threshold(),
            critical: default_critical_threshold(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Maximum number of busy workers (defaults to the CPU count)
    #[serde(default)]
    pub concurrent: Option<usize>,

    /// Worker caching
    #[serde(default)]
    pub cache: CacheSetting,

    /// Heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Load under which the low-priority channel is consumed
    #[serde(default)]
    pub low_priority_threshold: Option<f64>,

    /// Health status thresholds
    #[serde(default)]
    pub status: StatusThresholds,

    /// Spawn attempts before acquisition fails
    #[serde(default = "default_spawn_retries")]
    pub spawn_retries: u32,

    /// Seconds a new worker has to report `started`
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    /// Worker executable (defaults to `foreman-worker` next to the master binary)
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
}

fn default_spawn_retries() -> u32 {
    3
}

fn default_startup_timeout() -> u64 {
    10
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrent: None,
            cache: CacheSetting::default(),
            heartbeat: HeartbeatConfig::default(),
            low_priority_threshold: None,
            status: StatusThresholds::default(),
            spawn_retries: default_spawn_retries(),
            startup_timeout: default_startup_timeout(),
            worker_binary: None,
        }
    }
}

impl WorkersConfig {
    /// Pool ceiling
    pub fn ceiling(&self) -> usize {
        self.concurrent.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        })
    }

    /// Maximum number of cached workers
    pub fn cache_limit(&self) -> usize {
        self.cache.limit(self.ceiling())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }
}

/// Envelope compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Whether envelopes are framed with a compression mark
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Payloads of at least this many bytes are deflated
    #[serde(default = "default_compression_threshold")]
    pub threshold: usize,

    /// zlib level
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

fn default_true() -> bool {
    true
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_compression_level() -> u32 {
    7
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            threshold: default_compression_threshold(),
            level: default_compression_level(),
        }
    }
}

/// Management HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port; the server is not started without one
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
        }
    }
}

impl ManagementConfig {
    /// Bind address, if the server is enabled
    pub fn addr(&self) -> Option<String> {
        self.port.map(|port| format!("{}:{}", self.host, port))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Session liveness: the master keeps `key` alive while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Key to renew; renewal is disabled without one
    #[serde(default)]
    pub key: Option<String>,

    /// TTL set on every renewal, in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl: u64,

    /// Renewal period, in seconds
    #[serde(default = "default_session_renew_interval")]
    pub renew_interval: u64,
}

fn default_session_ttl() -> u64 {
    60
}

fn default_session_renew_interval() -> u64 {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key: None,
            ttl: default_session_ttl(),
            renew_interval: default_session_renew_interval(),
        }
    }
}

/// Options a worker process runs with, handed down by the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRunOptions {
    /// Root directory of tenant code
    pub repo_path: PathBuf,

    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,

    /// Apply the sandbox before the first task
    pub sandbox: bool,

    /// Log level for the worker's stderr log
    pub log_level: String,

    /// Log format for the worker's stderr log
    pub log_format: String,
}

impl Default for WorkerRunOptions {
    fn default() -> Self {
        Self::from_config(&ForemanConfig::default())
    }
}

impl WorkerRunOptions {
    /// Derive worker options from the master configuration
    pub fn from_config(config: &ForemanConfig) -> Self {
        Self {
            repo_path: config.repo_path.clone(),
            heartbeat_interval: config.workers.heartbeat.interval,
            sandbox: config.sandbox,
            log_level: config.logging.level.clone(),
            log_format: config.logging.format.clone(),
        }
    }

    /// Encode for the worker's environment
    pub fn to_env_value(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read from the environment; defaults apply when the variable is absent
    pub fn from_env() -> crate::Result<Self> {
        match std::env::var(RUN_OPTIONS_ENV) {
            Ok(value) => serde_json::from_str(&value).map_err(|e| {
                crate::Error::Configuration(format!("Invalid {}: {}", RUN_OPTIONS_ENV, e))
            }),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ForemanConfig::default();
        assert_eq!(config.broker.tasks_channel, "CODE_RUNNER_DRIVER");
        assert_eq!(config.broker.low_priority_channel, "JS_CR_QUEUE_LP");
        assert_eq!(config.broker.control_channel, "SERVICE_QUEUE_P_CR");
        assert_eq!(config.workers.heartbeat.interval, 5);
        assert_eq!(config.workers.heartbeat.timeout, 30);
        assert_eq!(config.compression.threshold, 1024);
        assert_eq!(config.compression.level, 7);
        assert!(config.management.addr().is_none());
    }

    #[test]
    fn test_cache_limit() {
        let mut workers = WorkersConfig {
            concurrent: Some(3),
            ..Default::default()
        };
        assert_eq!(workers.cache_limit(), 12);

        workers.cache = CacheSetting::Enabled(false);
        assert_eq!(workers.cache_limit(), 0);

        workers.cache = "5".parse().unwrap();
        assert_eq!(workers.cache_limit(), 5);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
repo_path = "/srv/code"

[workers]
concurrent = 2
cache = false
low_priority_threshold = 0.5

[management]
port = 9000
"#
        )
        .unwrap();

        let config = ForemanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.repo_path, PathBuf::from("/srv/code"));
        assert_eq!(config.workers.ceiling(), 2);
        assert_eq!(config.workers.cache, CacheSetting::Enabled(false));
        assert_eq!(config.workers.low_priority_threshold, Some(0.5));
        assert_eq!(config.management.addr().as_deref(), Some("0.0.0.0:9000"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = ForemanConfig::default();
        config.workers.low_priority_threshold = Some(1.5);
        assert!(config.validate().is_err());

        config.workers.low_priority_threshold = None;
        config.workers.concurrent = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_options_roundtrip_through_env_value() {
        let mut config = ForemanConfig::default();
        config.sandbox = true;
        let options = WorkerRunOptions::from_config(&config);
        let value = options.to_env_value().unwrap();
        let parsed: WorkerRunOptions = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed, options);
    }
}
