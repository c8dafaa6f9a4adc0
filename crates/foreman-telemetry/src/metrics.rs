//! Prometheus metrics for Foreman
//!
//! Covers the worker pool and the dispatch path:
//! - Worker gauges by membership, load and health status
//! - Task counters (dispatched, processed)
//! - Worker lifecycle counters (spawned, killed by reason)
//! - Task round-trip histogram
//! - Broker connectivity and dequeue failures

use lazy_static::lazy_static;
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};

use crate::{TelemetryError, TelemetryResult};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============ Pool Metrics ============

    /// Workers per membership (idle, cached, busy)
    pub static ref POOL_WORKERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("foreman_pool_workers", "Number of workers per membership"),
        &["membership"]
    ).expect("metric can be created");

    /// busy / ceiling
    pub static ref POOL_LOAD: Gauge = Gauge::new(
        "foreman_pool_load", "Share of the pool ceiling currently busy"
    ).expect("metric can be created");

    /// 0 = good, 1 = warning, 2 = critical
    pub static ref POOL_STATUS: IntGauge = IntGauge::new(
        "foreman_pool_status", "Pool health (0 good, 1 warning, 2 critical)"
    ).expect("metric can be created");

    /// Workers started
    pub static ref WORKERS_SPAWNED: IntCounter = IntCounter::new(
        "foreman_workers_spawned_total", "Total number of worker processes started"
    ).expect("metric can be created");

    /// Workers killed, by reason
    pub static ref WORKERS_KILLED: IntCounterVec = IntCounterVec::new(
        Opts::new("foreman_workers_killed_total", "Total number of worker processes killed"),
        &["reason"]
    ).expect("metric can be created");

    // ============ Task Metrics ============

    /// Tasks handed to a worker
    pub static ref TASKS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("foreman_tasks_dispatched_total", "Total number of tasks dispatched to workers"),
        &["kind"]
    ).expect("metric can be created");

    /// Tasks reported processed by a worker
    pub static ref TASKS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("foreman_tasks_processed_total", "Total number of tasks processed by workers"),
        &["kind"]
    ).expect("metric can be created");

    /// Dispatch-to-processed time
    pub static ref TASK_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("foreman_task_duration_seconds", "Time from dispatch to processed")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["kind"]
    ).expect("metric can be created");

    // ============ Broker Metrics ============

    /// Broker connection status (1 = connected, 0 = disconnected)
    pub static ref BROKER_CONNECTED: IntGauge = IntGauge::new(
        "foreman_broker_connected", "Broker connection status (1 = connected)"
    ).expect("metric can be created");

    /// Failed dequeues per channel
    pub static ref DEQUEUE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("foreman_dequeue_errors_total", "Total number of failed dequeues"),
        &["channel"]
    ).expect("metric can be created");
}

/// Foreman metrics interface
pub struct ForemanMetrics;

impl ForemanMetrics {
    /// Register all metrics with the global registry; safe to call more than once
    pub fn new() -> TelemetryResult<Self> {
        Self::register_metrics()?;
        BROKER_CONNECTED.set(1);
        Ok(Self)
    }

    fn register_metrics() -> TelemetryResult<()> {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(POOL_WORKERS.clone()),
            Box::new(POOL_LOAD.clone()),
            Box::new(POOL_STATUS.clone()),
            Box::new(WORKERS_SPAWNED.clone()),
            Box::new(WORKERS_KILLED.clone()),
            Box::new(TASKS_DISPATCHED.clone()),
            Box::new(TASKS_PROCESSED.clone()),
            Box::new(TASK_DURATION.clone()),
            Box::new(BROKER_CONNECTED.clone()),
            Box::new(DEQUEUE_ERRORS.clone()),
        ];

        for collector in collectors {
            match REGISTRY.register(collector) {
                Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
                Err(e) => return Err(TelemetryError::Metrics(e.to_string())),
            }
        }

        Ok(())
    }

    /// Set the pool gauges
    pub fn set_pool(idle: usize, cached: usize, busy: usize, load: f64, status: i64) {
        POOL_WORKERS.with_label_values(&["idle"]).set(idle as i64);
        POOL_WORKERS.with_label_values(&["cached"]).set(cached as i64);
        POOL_WORKERS.with_label_values(&["busy"]).set(busy as i64);
        POOL_LOAD.set(load);
        POOL_STATUS.set(status);
    }

    /// Record a worker start
    pub fn worker_spawned() {
        WORKERS_SPAWNED.inc();
    }

    /// Record a worker kill
    pub fn worker_killed(reason: &str) {
        WORKERS_KILLED.with_label_values(&[reason]).inc();
    }

    /// Record a dispatch
    pub fn task_dispatched(kind: &str) {
        TASKS_DISPATCHED.with_label_values(&[kind]).inc();
    }

    /// Record a processed task and its round-trip time
    pub fn task_processed(kind: &str, duration_secs: f64) {
        TASKS_PROCESSED.with_label_values(&[kind]).inc();
        TASK_DURATION.with_label_values(&[kind]).observe(duration_secs);
    }

    /// Record broker connectivity
    pub fn set_broker_connected(connected: bool) {
        BROKER_CONNECTED.set(i64::from(connected));
    }

    /// Record a failed dequeue
    pub fn dequeue_failed(channel: &str) {
        DEQUEUE_ERRORS.with_label_values(&[channel]).inc();
    }
}

/// Get metrics as Prometheus text format
pub fn gather() -> TelemetryResult<String> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        ForemanMetrics::new().unwrap();
        ForemanMetrics::new().unwrap();
    }

    #[test]
    fn test_gather_contains_pool_metrics() {
        ForemanMetrics::new().unwrap();
        ForemanMetrics::set_pool(1, 2, 3, 0.75, 1);
        ForemanMetrics::worker_killed("timeout");

        let text = gather().unwrap();
        assert!(text.contains("foreman_pool_workers{membership=\"busy\"} 3"));
        assert!(text.contains("foreman_pool_load 0.75"));
        assert!(text.contains("foreman_workers_killed_total{reason=\"timeout\"}"));
    }
}
