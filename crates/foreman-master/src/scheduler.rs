//! Task scheduler: pulls tasks off the broker channels as the pool frees up
//!
//! One outstanding request per channel at a time:
//! - primary channel while the pool has a free slot
//! - low-priority channel while the load is under the configured threshold
//!   and at least two slots are free; the request re-checks this between
//!   bounded polls and withdraws once it no longer holds
//! - control channel subscription for tenant purges

use foreman_broker::{BrokerClient, BrokerError, BrokerEvent, ControlMessage};
use foreman_core::{ForemanConfig, Task};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use foreman_telemetry::ForemanMetrics;

use crate::error::{PoolError, PoolResult, SchedulerError};
use crate::pool::{PoolNotice, WorkerPool};

/// Control command that purges a tenant's workers
pub const CLEANUP_CODE_ALL: &str = "cleanup_code_all";

/// Kill reason for workers purged by [`CLEANUP_CODE_ALL`]
pub const REDEPLOY_REASON: &str = "New business logic for the application has been deployed";

/// Longest single wait of a low-priority request before it re-checks the load
pub const LOW_PRIORITY_POLL: Duration = Duration::from_secs(1);

/// Pause after a failed dequeue before the channel is requested again
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Dispatch attempts per task when workers die while receiving it
const DISPATCH_ATTEMPTS: u32 = 3;

/// Task channels the scheduler requests from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Primary,
    LowPriority,
}

/// Session key kept alive while the master runs
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub key: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tasks_channel: String,
    pub low_priority_channel: String,
    pub control_channel: String,

    /// Load under which the low-priority channel is consumed; `None` never consumes it
    pub low_priority_threshold: Option<f64>,

    pub session: Option<SessionKey>,
}

impl SchedulerConfig {
    pub fn from_config(config: &ForemanConfig) -> Self {
        Self {
            tasks_channel: config.broker.tasks_channel.clone(),
            low_priority_channel: config.broker.low_priority_channel.clone(),
            control_channel: config.broker.control_channel.clone(),
            low_priority_threshold: config.workers.low_priority_threshold,
            session: config.session.key.as_ref().map(|key| SessionKey {
                key: key.clone(),
                ttl: Duration::from_secs(config.session.ttl),
                renew_interval: Duration::from_secs(config.session.renew_interval.max(1)),
            }),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&ForemanConfig::default())
    }
}

/// Scheduler - feeds broker tasks to the worker pool and publishes results
pub struct Scheduler {
    /// Configuration
    config: SchedulerConfig,

    /// Broker client
    client: BrokerClient,

    /// Worker pool
    pool: Arc<WorkerPool>,

    /// Outstanding request flags
    primary_requested: AtomicBool,
    low_priority_requested: AtomicBool,

    /// Broker connection lost
    paused: AtomicBool,

    /// No new requests once set
    stopping: AtomicBool,

    /// Starts the graceful shutdown
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Create a new scheduler; cancelling `shutdown` makes [`Scheduler::run`] drain and return
    pub fn new(
        config: SchedulerConfig,
        client: BrokerClient,
        pool: Arc<WorkerPool>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            pool,
            primary_requested: AtomicBool::new(false),
            low_priority_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Whether a request is outstanding on `channel`
    pub fn is_requesting(&self, channel: Channel) -> bool {
        self.flag(channel).load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn flag(&self, channel: Channel) -> &AtomicBool {
        match channel {
            Channel::Primary => &self.primary_requested,
            Channel::LowPriority => &self.low_priority_requested,
        }
    }

    fn channel_name(&self, channel: Channel) -> &str {
        match channel {
            Channel::Primary => &self.config.tasks_channel,
            Channel::LowPriority => &self.config.low_priority_channel,
        }
    }

    /// Run until shutdown completes or the session is lost
    ///
    /// Shutdown order: stop dequeuing, drain the pool, publish the results
    /// that came in meanwhile, stop publishing, kill the remaining workers.
    pub async fn run(
        self: Arc<Self>,
        mut notices: mpsc::UnboundedReceiver<PoolNotice>,
    ) -> Result<(), SchedulerError> {
        let mut control = self.client.subscribe(&self.config.control_channel).await?;
        let mut control_open = true;
        let mut events = self.client.events();
        let mut events_open = true;
        let mut session = self.config.session.as_ref().map(|session| {
            let mut ticker = interval_at(
                Instant::now() + session.renew_interval,
                session.renew_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let drained = CancellationToken::new();

        info!(
            "Scheduler started on {} (low priority: {}, control: {})",
            self.config.tasks_channel,
            match self.config.low_priority_threshold {
                Some(threshold) => format!("{} under {}", self.config.low_priority_channel, threshold),
                None => "disabled".to_string(),
            },
            self.config.control_channel
        );

        self.on_ready_for_next_tasks().await;

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled(), if !self.stopping.load(Ordering::SeqCst) => {
                    info!("Stopping scheduler, waiting for busy workers");
                    self.stopping.store(true, Ordering::SeqCst);
                    self.client.stop_dequeue().await;

                    let pool = Arc::clone(&self.pool);
                    let drained = drained.clone();
                    tokio::spawn(async move {
                        pool.drain().await;
                        drained.cancel();
                    });
                }
                _ = drained.cancelled() => break Ok(()),
                notice = notices.recv() => match notice {
                    Some(PoolNotice::ReadyForNextTask) => self.on_ready_for_next_tasks().await,
                    Some(PoolNotice::TaskProcessed { task, result }) => self.publish(&task, result).await,
                    None => break Ok(()),
                },
                message = control.recv(), if control_open => match message {
                    Some(message) => self.on_control(message).await,
                    None => {
                        warn!("Control channel subscription closed");
                        control_open = false;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.on_broker_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Missed {} broker events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                _ = tick(&mut session) => {
                    if let Err(e) = self.renew_session().await {
                        break Err(e);
                    }
                }
            }
        };

        self.stopping.store(true, Ordering::SeqCst);

        while let Ok(notice) = notices.try_recv() {
            if let PoolNotice::TaskProcessed { task, result } = notice {
                self.publish(&task, result).await;
            }
        }

        self.client.stop_publish().await;
        self.pool.shutdown().await;
        info!("Scheduler stopped");

        outcome
    }

    /// Arm the channels the pool has room for
    pub async fn on_ready_for_next_tasks(self: &Arc<Self>) {
        if self.is_paused() || self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let available = self.pool.available_slots().await;
        if available > 0 {
            self.request(Channel::Primary);
        }

        if self.low_priority_allowed(available, self.pool.load().await) {
            self.request(Channel::LowPriority);
        }
    }

    fn low_priority_allowed(&self, available: usize, load: f64) -> bool {
        !self.is_paused()
            && !self.stopping.load(Ordering::SeqCst)
            && available > 1
            && self
                .config
                .low_priority_threshold
                .is_some_and(|threshold| threshold > load)
    }

    fn request(self: &Arc<Self>, channel: Channel) {
        if self
            .flag(channel)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!("Requesting next task from {}", self.channel_name(channel));
        tokio::spawn(Arc::clone(self).next_task(channel));
    }

    fn release(&self, channel: Channel) {
        self.flag(channel).store(false, Ordering::SeqCst);
    }

    async fn next_task(self: Arc<Self>, channel: Channel) {
        let name = self.channel_name(channel).to_string();

        let received = match channel {
            Channel::Primary => self.client.next_task(&name).await.map(Some),
            Channel::LowPriority => self.poll_low_priority(&name).await,
        };

        match received {
            Ok(Some(task)) => self.take(channel, task).await,
            Ok(None) => {
                debug!("Withdrew the request on {}", name);
                self.release(channel);
                self.on_ready_for_next_tasks().await;
            }
            Err(BrokerError::Stopped) => {
                debug!("Dequeue on {} stopped", name);
                self.release(channel);
            }
            Err(e) => {
                warn!("Failed to receive a task from {}: {}", name, e);

                #[cfg(feature = "metrics")]
                ForemanMetrics::dequeue_failed(&name);

                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
                self.release(channel);
                self.on_ready_for_next_tasks().await;
            }
        }
    }

    /// Bounded polls while the low-priority conditions hold; `None` once they stop holding
    async fn poll_low_priority(&self, name: &str) -> Result<Option<Task>, BrokerError> {
        loop {
            let available = self.pool.available_slots().await;
            if !self.low_priority_allowed(available, self.pool.load().await) {
                return Ok(None);
            }

            if let Some(task) = self.client.poll_task(name, LOW_PRIORITY_POLL).await? {
                return Ok(Some(task));
            }
        }
    }

    async fn take(self: Arc<Self>, channel: Channel, mut task: Task) {
        // held until the task is on a worker, so slow starts stay under the ceiling
        let slot = match self.pool.reserve().await {
            Ok(slot) => slot,
            Err(e) => {
                error!("[{}] Unable to run task ({}): {}", task.id, task.details(), e);
                self.release(channel);
                return;
            }
        };

        // with room to spare the channel may be requested again right away
        let release_early = self.pool.available_slots().await > 2;
        if release_early {
            self.release(channel);
            self.on_ready_for_next_tasks().await;
        }

        task.prepare(self.pool.config().cache_enabled());
        let task_id = task.id.clone();
        let details = task.details();

        if let Err(e) = self.assign(task).await {
            error!("[{}] Unable to run task ({}): {}", task_id, details, e);
        }
        drop(slot);

        if !release_early {
            self.release(channel);
        }
        self.on_ready_for_next_tasks().await;
    }

    async fn assign(&self, task: Task) -> PoolResult<()> {
        let mut attempts = 0;

        loop {
            let worker = self
                .pool
                .acquire(&task.application_id, task.cacheable)
                .await?;

            match self.pool.dispatch(task.clone(), worker).await {
                Ok(()) => return Ok(()),
                Err(PoolError::Dispatch { worker, reason }) if attempts + 1 < DISPATCH_ATTEMPTS => {
                    warn!("[{}] Dispatch to {} failed, retrying: {}", task.id, worker, reason);
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish(&self, task: &Task, result: Option<String>) {
        let Some(result) = result else {
            debug!("[{}] Task produced no result", task.id);
            return;
        };

        if let Err(e) = self.client.send_result(task, &result).await {
            error!("[{}] Failed to publish result: {}", task.id, e);
        }
    }

    async fn on_control(&self, message: ControlMessage) {
        match message.field("command") {
            Some(CLEANUP_CODE_ALL) => match message.field("applicationId") {
                Some(application_id) => {
                    info!("Cleaning up workers of {}", application_id);
                    self.pool.purge_tenant(application_id, REDEPLOY_REASON).await;
                }
                None => warn!("{} without an applicationId", CLEANUP_CODE_ALL),
            },
            Some(other) => debug!("Ignoring control command {}", other),
            None => debug!("Ignoring control message {:?}", message),
        }
    }

    async fn on_broker_event(self: &Arc<Self>, event: BrokerEvent) {
        #[cfg(feature = "metrics")]
        ForemanMetrics::set_broker_connected(event == BrokerEvent::Reconnected);

        match event {
            BrokerEvent::Disconnected => {
                warn!("Broker connection lost, pausing");
                self.paused.store(true, Ordering::SeqCst);
            }
            BrokerEvent::Reconnected => {
                info!("Broker connection restored, resuming");
                self.paused.store(false, Ordering::SeqCst);
                self.on_ready_for_next_tasks().await;
            }
        }
    }

    async fn renew_session(&self) -> Result<(), SchedulerError> {
        let Some(session) = &self.config.session else {
            return Ok(());
        };

        match self.client.renew_session(&session.key, session.ttl).await {
            Ok(()) => {
                debug!("Renewed session {}", session.key);
                Ok(())
            }
            Err(e @ BrokerError::KeyNotFound(_)) => {
                error!("Session lost: {}", e);
                Err(SchedulerError::SessionLost(e))
            }
            Err(e) => {
                warn!("Failed to renew session {}: {}", session.key, e);
                Ok(())
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
