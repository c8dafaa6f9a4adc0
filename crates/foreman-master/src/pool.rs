//! Worker pool management
//!
//! Workers move through `spawning → busy → cached ⇄ busy` and can be
//! killed from any state. A worker leaves `spawning` for `busy` under the
//! same lock that saw its handshake, so a fresh worker is never visible as
//! idle to a competing acquirer. Every membership change goes through
//! [`WorkerPool::relocate`] or [`WorkerPool::kill`] while the state lock is
//! held, and worker messages are applied by a single event loop in arrival
//! order.

use foreman_core::{MasterMessage, Task, WorkerMessage, WorkerSignal, WorkersConfig};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use foreman_telemetry::ForemanMetrics;

use crate::error::{PoolError, PoolResult};
use crate::process::{WorkerEvent, WorkerHandle, WorkerLauncher};

/// Added to a task's timeout before its worker is killed
pub const WORKER_TEARDOWN_GRACE: Duration = Duration::from_millis(2000);

/// How often the pool health is recomputed
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// How long the pool may stay unhealthy before a warning is logged
pub const WARN_STATUS_AFTER: Duration = Duration::from_secs(5);

/// Stable identifier of a worker for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Which list a worker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// Started, waiting for its handshake
    Spawning,
    Idle,
    /// Finished a cacheable task and kept for its tenant
    Cached,
    Busy,
}

/// Pool health derived from the load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Good,
    Warning,
    Critical,
}

impl PoolHealth {
    pub fn from_load(load: f64, warning: f64, critical: f64) -> Self {
        if load > critical {
            PoolHealth::Critical
        } else if load > warning {
            PoolHealth::Warning
        } else {
            PoolHealth::Good
        }
    }

    /// Gauge value: 0 good, 1 warning, 2 critical
    pub fn as_metric(&self) -> i64 {
        match self {
            PoolHealth::Good => 0,
            PoolHealth::Warning => 1,
            PoolHealth::Critical => 2,
        }
    }
}

/// Snapshot served by the management endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub status: PoolHealth,
    /// Busy share of the ceiling, e.g. `"50.00%"`
    pub load: String,
    pub total: usize,
    pub available: usize,
    pub idle: usize,
    pub cached: usize,
    pub busy: usize,
    pub max_concurrent: usize,
}

/// Introspection record for one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub membership: Membership,
    pub tenant: Option<String>,
    pub task_id: Option<String>,
    pub to_be_removed: bool,
}

/// What the pool tells the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum PoolNotice {
    /// Busy membership changed and there is room for more work
    ReadyForNextTask,
    /// A worker reported a task as processed
    TaskProcessed {
        task: Box<Task>,
        result: Option<String>,
    },
}

/// Why a worker was killed
#[derive(Debug, Clone, PartialEq)]
pub enum KillReason {
    TaskTimeout(Duration),
    HeartbeatTimeout {
        timeout: Duration,
        elapsed: Duration,
        details: String,
    },
    /// Least recently used cached worker pushed out of a full cache
    Evicted,
    /// The tenant's code changed
    Purged(String),
    /// Finished a task that may not be cached
    NotCacheable,
    SpawnFailed(String),
    DispatchFailed(String),
    /// The process went away on its own
    Exited,
    Shutdown,
}

impl KillReason {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            KillReason::TaskTimeout(_) => "task_timeout",
            KillReason::HeartbeatTimeout { .. } => "heartbeat_timeout",
            KillReason::Evicted => "evicted",
            KillReason::Purged(_) => "purged",
            KillReason::NotCacheable => "not_cacheable",
            KillReason::SpawnFailed(_) => "spawn_failed",
            KillReason::DispatchFailed(_) => "dispatch_failed",
            KillReason::Exited => "exited",
            KillReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::TaskTimeout(timeout) => write!(
                f,
                "Worker expired due to task timeout ({}ms)",
                timeout.as_millis()
            ),
            KillReason::HeartbeatTimeout {
                timeout,
                elapsed,
                details,
            } => write!(
                f,
                "Worker expired due to heartbeat timeout ({}ms), the last ping was {}ms ago [{}]",
                timeout.as_millis(),
                elapsed.as_millis(),
                details
            ),
            KillReason::Evicted => write!(
                f,
                "Killed the least active cached worker, because cached pool is full"
            ),
            KillReason::Purged(reason) => write!(f, "{}", reason),
            KillReason::NotCacheable => write!(f, "Worker finished a task that cannot be cached"),
            KillReason::SpawnFailed(reason) => write!(f, "Worker failed to start: {}", reason),
            KillReason::DispatchFailed(reason) => {
                write!(f, "Worker could not receive its task: {}", reason)
            }
            KillReason::Exited => write!(f, "Worker exited unexpectedly"),
            KillReason::Shutdown => write!(f, "Worker pool is shutting down"),
        }
    }
}

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of busy workers
    pub ceiling: usize,

    /// Maximum number of cached workers; zero disables caching
    pub cache_limit: usize,

    /// Silence after which a worker is killed
    pub heartbeat_timeout: Duration,

    /// Extra spawn attempts before acquisition fails
    pub spawn_retries: u32,

    /// Time a new worker has to report `started`
    pub startup_timeout: Duration,

    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl PoolConfig {
    pub fn from_workers(config: &WorkersConfig) -> Self {
        Self {
            ceiling: config.ceiling(),
            cache_limit: config.cache_limit(),
            heartbeat_timeout: config.heartbeat.timeout(),
            spawn_retries: config.spawn_retries,
            startup_timeout: config.startup_timeout(),
            warning_threshold: config.status.warning,
            critical_threshold: config.status.critical,
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_limit > 0
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_workers(&WorkersConfig::default())
    }
}

struct ActiveTask {
    task: Task,
    dispatched_at: Instant,
}

struct WorkerRecord {
    id: WorkerId,
    pid: Option<u32>,
    membership: Membership,
    last_heartbeat: Instant,

    /// Tenant the worker is bound to for caching
    tenant: Option<String>,

    /// Last task dispatched to the worker
    task: Option<ActiveTask>,

    /// Bumped on every dispatch so stale expiration timers are ignored
    task_seq: u64,

    expiration: Option<AbortHandle>,

    /// Set when the worker must not be reused; honored at idling
    removal: Option<String>,

    handle: Box<dyn WorkerHandle>,
}

impl WorkerRecord {
    fn serves(&self, tenant: &str) -> bool {
        self.tenant.as_deref() == Some(tenant)
            || self
                .task
                .as_ref()
                .is_some_and(|active| active.task.application_id == tenant)
    }

    fn details(&self) -> String {
        match &self.task {
            Some(active) => active.task.details(),
            None => format!("appId: {}", self.tenant.as_deref().unwrap_or("none")),
        }
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            pid: self.pid,
            membership: self.membership,
            tenant: self.tenant.clone(),
            task_id: self.task.as_ref().map(|active| active.task.id.to_string()),
            to_be_removed: self.removal.is_some(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerRecord>,

    /// Most recently added first
    idle: VecDeque<WorkerId>,
    cached: VecDeque<WorkerId>,
    busy: VecDeque<WorkerId>,

    /// Workers waiting for their `started` signal
    handshakes: HashMap<WorkerId, oneshot::Sender<()>>,

    draining: bool,
}

impl PoolState {
    fn list_mut(&mut self, membership: Membership) -> Option<&mut VecDeque<WorkerId>> {
        match membership {
            Membership::Spawning => None,
            Membership::Idle => Some(&mut self.idle),
            Membership::Cached => Some(&mut self.cached),
            Membership::Busy => Some(&mut self.busy),
        }
    }

    fn unlink(&mut self, id: WorkerId, membership: Membership) {
        if let Some(list) = self.list_mut(membership) {
            list.retain(|other| *other != id);
        }
    }
}

#[derive(Default)]
struct Slots {
    /// Slots promised to tasks that are taken but not yet on a worker
    reserved: AtomicUsize,
    freed: Notify,
}

/// A slot under the ceiling held for one task until it is on a worker
///
/// Reserved slots count against [`WorkerPool::available_slots`], so tasks
/// still waiting for a worker to start cannot push the pool over its ceiling.
pub struct SlotReservation {
    slots: Arc<Slots>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.slots.reserved.fetch_sub(1, Ordering::SeqCst);
        self.slots.freed.notify_waiters();
    }
}

/// Worker pool - owns the worker subprocesses and hands them out per task
pub struct WorkerPool {
    /// Configuration
    config: PoolConfig,

    /// Starts worker processes
    launcher: Arc<dyn WorkerLauncher>,

    /// Workers and membership lists
    state: Mutex<PoolState>,

    /// Where launched workers report to
    events: mpsc::UnboundedSender<WorkerEvent>,

    /// Notices for the scheduler
    notices: mpsc::UnboundedSender<PoolNotice>,

    /// Number of busy workers, watched by `drain`
    busy_count: watch::Sender<usize>,

    slots: Arc<Slots>,

    next_id: AtomicU64,

    /// Stops the background loops
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Create a pool and start its event loop, heartbeat checker and status watcher
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolNotice>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let (busy_count, _) = watch::channel(0);

        let pool = Arc::new(Self {
            config,
            launcher,
            state: Mutex::new(PoolState::default()),
            events,
            notices,
            busy_count,
            slots: Arc::default(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&pool).event_loop(events_rx));
        tokio::spawn(Arc::clone(&pool).heartbeat_loop());
        tokio::spawn(Arc::clone(&pool).status_loop());

        info!(
            "Worker pool ready: {} concurrent workers, {} cached",
            pool.config.ceiling, pool.config.cache_limit
        );

        (pool, notices_rx)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a worker for a task of `tenant`; the worker is busy when this returns
    pub async fn acquire(&self, tenant: &str, cacheable: bool) -> PoolResult<WorkerId> {
        let mut attempts = 0u32;

        loop {
            {
                let mut state = self.state.lock().await;
                if state.draining {
                    return Err(PoolError::Draining);
                }
                if let Some(id) = self.take_ready(&mut state, tenant, cacheable) {
                    return Ok(id);
                }
                if self.config.cache_enabled() && state.cached.len() >= self.config.cache_limit {
                    if let Some(victim) = state.cached.back().copied() {
                        self.kill(&mut state, victim, KillReason::Evicted);
                    }
                }
            }

            match self.spawn_worker(cacheable.then_some(tenant)).await {
                Ok(id) => return Ok(id),
                Err(PoolError::Draining) => return Err(PoolError::Draining),
                Err(e) => warn!("Failed to spawn a worker: {}", e),
            }

            attempts += 1;
            if attempts > self.config.spawn_retries {
                return Err(PoolError::Provisioning(format!(
                    "gave up after {} attempts",
                    attempts
                )));
            }
        }
    }

    /// A cached worker of the tenant, else the oldest idle worker
    fn take_ready(&self, state: &mut PoolState, tenant: &str, cacheable: bool) -> Option<WorkerId> {
        if cacheable && self.config.cache_enabled() {
            let workers = &state.workers;
            let cached = state.cached.iter().copied().find(|id| {
                workers
                    .get(id)
                    .is_some_and(|record| record.tenant.as_deref() == Some(tenant))
            });
            if let Some(id) = cached {
                debug!("[{}] Reusing cached worker for {}", id, tenant);
                self.relocate(state, id, Membership::Busy);
                return Some(id);
            }
        }

        let id = state.idle.back().copied()?;
        if let Some(record) = state.workers.get_mut(&id) {
            record.tenant = cacheable.then(|| tenant.to_string());
        }
        self.relocate(state, id, Membership::Busy);
        Some(id)
    }

    /// Launch a worker and wait for its handshake; the worker comes back busy,
    /// bound to `tenant` when given
    async fn spawn_worker(&self, tenant: Option<&str>) -> PoolResult<WorkerId> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (started_tx, started_rx) = oneshot::channel();
        self.state.lock().await.handshakes.insert(id, started_tx);

        let started = Instant::now();
        let handle = match self.launcher.launch(id, self.events.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state.lock().await.handshakes.remove(&id);
                return Err(e);
            }
        };
        let pid = handle.pid();

        self.state.lock().await.workers.insert(
            id,
            WorkerRecord {
                id,
                pid,
                membership: Membership::Spawning,
                last_heartbeat: Instant::now(),
                tenant: None,
                task: None,
                task_seq: 0,
                expiration: None,
                removal: None,
                handle,
            },
        );

        #[cfg(feature = "metrics")]
        ForemanMetrics::worker_spawned();

        let handshake = tokio::time::timeout(self.config.startup_timeout, started_rx).await;

        let mut state = self.state.lock().await;
        let failure = match handshake {
            Ok(Ok(())) if state.workers.contains_key(&id) => None,
            Ok(_) => Some("exited before reporting started".to_string()),
            Err(_) => Some(format!(
                "no started signal within {}ms",
                self.config.startup_timeout.as_millis()
            )),
        };

        if let Some(reason) = failure {
            state.handshakes.remove(&id);
            self.kill(&mut state, id, KillReason::SpawnFailed(reason.clone()));
            return Err(PoolError::Provisioning(reason));
        }
        if state.draining {
            self.kill(&mut state, id, KillReason::Shutdown);
            return Err(PoolError::Draining);
        }

        info!(
            "[{}] Worker started in {}ms",
            pid.map(|pid| pid.to_string()).unwrap_or_else(|| id.to_string()),
            started.elapsed().as_millis()
        );
        if let Some(record) = state.workers.get_mut(&id) {
            record.tenant = tenant.map(str::to_string);
        }
        // straight to busy under the same lock so no other acquirer can take it
        self.relocate(&mut state, id, Membership::Busy);
        Ok(id)
    }

    /// Hold a slot under the ceiling for a task about to be acquired;
    /// waits while the pool is full
    pub async fn reserve(&self) -> PoolResult<SlotReservation> {
        loop {
            let freed = self.slots.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let state = self.state.lock().await;
                if state.draining {
                    return Err(PoolError::Draining);
                }
                if self.available(&state) > 0 {
                    self.slots.reserved.fetch_add(1, Ordering::SeqCst);
                    return Ok(SlotReservation {
                        slots: Arc::clone(&self.slots),
                    });
                }
            }

            debug!("No free slot, waiting for a worker to finish");
            freed.await;
        }
    }

    /// Hand a task to an acquired worker
    pub async fn dispatch(self: &Arc<Self>, task: Task, id: WorkerId) -> PoolResult<()> {
        let mut state = self.state.lock().await;
        let Some(record) = state.workers.get_mut(&id) else {
            return Err(PoolError::UnknownWorker(id));
        };

        record.task_seq += 1;
        let seq = record.task_seq;
        if let Some(expiration) = record.expiration.take() {
            expiration.abort();
        }

        if let Some(timeout) = task.enforced_timeout() {
            let pool = Arc::downgrade(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout + WORKER_TEARDOWN_GRACE).await;
                if let Some(pool) = pool.upgrade() {
                    pool.expire_task(id, seq, timeout).await;
                }
            });
            record.expiration = Some(timer.abort_handle());
        }

        debug!("[{}] Dispatching task {}: {}", id, task.id, task.details());

        #[cfg(feature = "metrics")]
        ForemanMetrics::task_dispatched(task.kind.class_name());

        let sent = record.handle.send(&MasterMessage::Task(Box::new(task.clone())));
        record.task = Some(ActiveTask {
            task,
            dispatched_at: Instant::now(),
        });

        if let Err(e) = sent {
            self.kill(&mut state, id, KillReason::DispatchFailed(e.to_string()));
            return Err(e);
        }

        Ok(())
    }

    async fn expire_task(&self, id: WorkerId, seq: u64, timeout: Duration) {
        let mut state = self.state.lock().await;
        let current = state
            .workers
            .get(&id)
            .is_some_and(|record| record.task_seq == seq && record.membership == Membership::Busy);

        if current {
            self.kill(&mut state, id, KillReason::TaskTimeout(timeout));
        }
    }

    /// Kill cached workers of a tenant and flag its busy ones for removal at idling
    pub async fn purge_tenant(&self, tenant: &str, reason: &str) {
        let mut state = self.state.lock().await;
        let mut flagged = 0;
        let mut doomed = Vec::new();

        for record in state.workers.values_mut() {
            if !record.serves(tenant) {
                continue;
            }
            match record.membership {
                Membership::Busy => {
                    record.removal = Some(reason.to_string());
                    flagged += 1;
                }
                Membership::Cached | Membership::Idle => doomed.push(record.id),
                Membership::Spawning => {}
            }
        }

        let killed = doomed.len();
        for id in doomed {
            self.kill(&mut state, id, KillReason::Purged(reason.to_string()));
        }

        info!(
            "Purged workers of {}: {} killed, {} flagged for removal",
            tenant, killed, flagged
        );
    }

    /// Stop admitting work and wait until no worker is busy
    pub async fn drain(&self) {
        self.state.lock().await.draining = true;
        self.slots.freed.notify_waiters();

        let mut busy = self.busy_count.subscribe();
        loop {
            let remaining = *busy.borrow_and_update();
            if remaining == 0 {
                break;
            }
            info!("Draining worker pool, remains {} busy workers", remaining);
            if busy.changed().await.is_err() {
                break;
            }
        }

        info!("Worker pool drained");
    }

    /// Stop the background loops and kill every remaining worker
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let mut state = self.state.lock().await;
        state.draining = true;
        self.slots.freed.notify_waiters();
        let ids: Vec<_> = state.workers.keys().copied().collect();
        for id in ids {
            self.kill(&mut state, id, KillReason::Shutdown);
        }
        state.handshakes.clear();
    }

    /// Free slots under the ceiling, net of reservations; zero while draining
    pub async fn available_slots(&self) -> usize {
        let state = self.state.lock().await;
        self.available(&state)
    }

    fn available(&self, state: &PoolState) -> usize {
        if state.draining {
            0
        } else {
            let taken = state.busy.len() + self.slots.reserved.load(Ordering::SeqCst);
            self.config.ceiling.saturating_sub(taken)
        }
    }

    fn load_of(&self, state: &PoolState) -> f64 {
        if self.config.ceiling == 0 {
            return 1.0;
        }
        state.busy.len() as f64 / self.config.ceiling as f64
    }

    /// Busy share of the ceiling
    pub async fn load(&self) -> f64 {
        let state = self.state.lock().await;
        self.load_of(&state)
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        self.stats_of(&state)
    }

    fn stats_of(&self, state: &PoolState) -> PoolStats {
        let load = self.load_of(state);
        PoolStats {
            status: self.health(load),
            load: format!("{:.2}%", load * 100.0),
            total: state.workers.len(),
            available: self.available(state),
            idle: state.idle.len(),
            cached: state.cached.len(),
            busy: state.busy.len(),
            max_concurrent: self.config.ceiling,
        }
    }

    fn health(&self, load: f64) -> PoolHealth {
        PoolHealth::from_load(
            load,
            self.config.warning_threshold,
            self.config.critical_threshold,
        )
    }

    /// Every live worker, ordered by id
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.lock().await;
        let mut workers: Vec<_> = state.workers.values().map(WorkerRecord::info).collect();
        workers.sort_by_key(|info| info.id);
        workers
    }

    pub async fn worker(&self, id: WorkerId) -> Option<WorkerInfo> {
        self.state.lock().await.workers.get(&id).map(WorkerRecord::info)
    }

    /// Move a worker to another list
    fn relocate(&self, state: &mut PoolState, id: WorkerId, membership: Membership) {
        let Some(record) = state.workers.get_mut(&id) else {
            return;
        };
        let previous = std::mem::replace(&mut record.membership, membership);
        let busy_before = state.busy.len();

        state.unlink(id, previous);
        if let Some(list) = state.list_mut(membership) {
            list.push_front(id);
        }

        self.busy_changed(state, busy_before);
    }

    /// Remove a worker from the pool and terminate its process
    fn kill(&self, state: &mut PoolState, id: WorkerId, reason: KillReason) {
        let Some(mut record) = state.workers.remove(&id) else {
            return;
        };
        let busy_before = state.busy.len();
        state.unlink(id, record.membership);
        state.handshakes.remove(&id);

        if let Some(expiration) = record.expiration.take() {
            expiration.abort();
        }
        record.handle.kill();

        match reason {
            KillReason::Shutdown => debug!("[{}] {}", id, reason),
            _ => warn!("[{}] {}", id, reason),
        }

        #[cfg(feature = "metrics")]
        ForemanMetrics::worker_killed(reason.label());

        self.busy_changed(state, busy_before);
    }

    fn busy_changed(&self, state: &PoolState, busy_before: usize) {
        let busy = state.busy.len();
        if busy == busy_before {
            return;
        }
        if busy < busy_before {
            self.slots.freed.notify_waiters();
        }

        self.busy_count.send_if_modified(|count| {
            let modified = *count != busy;
            *count = busy;
            modified
        });

        if self.available(state) > 0 {
            let _ = self.notices.send(PoolNotice::ReadyForNextTask);
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        let mut state = self.state.lock().await;

        match event {
            WorkerEvent::Exited(id) => {
                // a worker still waiting for its handshake is cleaned up by the spawner
                if state.handshakes.remove(&id).is_none() {
                    self.kill(&mut state, id, KillReason::Exited);
                }
            }
            WorkerEvent::Message(id, WorkerMessage::Signal(WorkerSignal::Started)) => {
                if let Some(started) = state.handshakes.remove(&id) {
                    let _ = started.send(());
                }
                if let Some(record) = state.workers.get_mut(&id) {
                    record.last_heartbeat = Instant::now();
                }
            }
            WorkerEvent::Message(id, message) => {
                let Some(record) = state.workers.get_mut(&id) else {
                    debug!("[{}] Discarding message from a removed worker", id);
                    return;
                };
                record.last_heartbeat = Instant::now();

                match message {
                    WorkerMessage::Signal(WorkerSignal::Heartbeat) => {}
                    WorkerMessage::Signal(WorkerSignal::Idling) => self.on_idling(&mut state, id),
                    WorkerMessage::Processed { task_result, .. } => {
                        if record.membership != Membership::Busy {
                            debug!("[{}] Discarding a result outside of a task", id);
                            return;
                        }
                        let Some(active) = &record.task else {
                            warn!("[{}] Worker reported a result without a task", id);
                            return;
                        };

                        #[cfg(feature = "metrics")]
                        ForemanMetrics::task_processed(
                            active.task.kind.class_name(),
                            active.dispatched_at.elapsed().as_secs_f64(),
                        );

                        debug!(
                            "[{}] Task {} processed in {}ms",
                            id,
                            active.task.id,
                            active.dispatched_at.elapsed().as_millis()
                        );

                        let _ = self.notices.send(PoolNotice::TaskProcessed {
                            task: Box::new(active.task.clone()),
                            result: task_result,
                        });
                    }
                    WorkerMessage::Signal(WorkerSignal::Started) => {}
                }
            }
        }
    }

    fn on_idling(&self, state: &mut PoolState, id: WorkerId) {
        let Some(record) = state.workers.get_mut(&id) else {
            return;
        };
        if record.membership != Membership::Busy {
            return;
        }
        if let Some(expiration) = record.expiration.take() {
            expiration.abort();
        }

        let cacheable = record.task.as_ref().is_some_and(|active| active.task.cacheable);

        if let Some(reason) = record.removal.clone() {
            self.kill(state, id, KillReason::Purged(reason));
            return;
        }
        if !cacheable || !self.config.cache_enabled() {
            self.kill(state, id, KillReason::NotCacheable);
            return;
        }

        if state.cached.len() >= self.config.cache_limit {
            if let Some(victim) = state.cached.back().copied() {
                self.kill(state, victim, KillReason::Evicted);
            }
        }
        self.relocate(state, id, Membership::Cached);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.config.heartbeat_timeout.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.expire_silent_workers().await,
            }
        }
    }

    async fn expire_silent_workers(&self) {
        let mut state = self.state.lock().await;
        let timeout = self.config.heartbeat_timeout;

        let expired: Vec<_> = state
            .workers
            .values()
            .filter(|record| record.membership != Membership::Spawning)
            .filter_map(|record| {
                let elapsed = record.last_heartbeat.elapsed();
                (elapsed > timeout).then(|| (record.id, elapsed, record.details()))
            })
            .collect();

        for (id, elapsed, details) in expired {
            self.kill(
                &mut state,
                id,
                KillReason::HeartbeatTimeout {
                    timeout,
                    elapsed,
                    details,
                },
            );
        }
    }

    async fn status_loop(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unhealthy_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.stats().await;

                    #[cfg(feature = "metrics")]
                    ForemanMetrics::set_pool(
                        stats.idle,
                        stats.cached,
                        stats.busy,
                        self.load().await,
                        stats.status.as_metric(),
                    );

                    if stats.status == PoolHealth::Good {
                        unhealthy_since = None;
                        continue;
                    }

                    let since = *unhealthy_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > WARN_STATUS_AFTER {
                        warn!(
                            "Worker pool status is {:?}: {}",
                            stats.status,
                            serde_json::to_string(&stats).unwrap_or_default()
                        );
                        unhealthy_since = Some(Instant::now());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Worker stand-in: handshakes at launch and answers each task after `delay`
    #[derive(Default)]
    struct FakeLauncher {
        delay: Duration,
        launched: AtomicUsize,
        failures_left: AtomicUsize,
    }

    struct FakeHandle {
        id: WorkerId,
        tasks: mpsc::UnboundedSender<Task>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        worker: tokio::task::JoinHandle<()>,
    }

    impl WorkerHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn send(&self, message: &MasterMessage) -> PoolResult<()> {
            let MasterMessage::Task(task) = message;
            self.tasks.send((**task).clone()).map_err(|_| PoolError::Dispatch {
                worker: self.id,
                reason: "closed".into(),
            })
        }

        fn kill(&mut self) {
            self.worker.abort();
            let _ = self.events.send(WorkerEvent::Exited(self.id));
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            id: WorkerId,
            events: mpsc::UnboundedSender<WorkerEvent>,
        ) -> PoolResult<Box<dyn WorkerHandle>> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PoolError::Provisioning("no such binary".into()));
            }

            let (tasks, mut rx) = mpsc::unbounded_channel::<Task>();
            let out = events.clone();
            let delay = self.delay;
            let worker = tokio::spawn(async move {
                let _ = out.send(WorkerEvent::Message(id, WorkerMessage::started()));
                while let Some(task) = rx.recv().await {
                    tokio::time::sleep(delay).await;
                    let result = format!("{{\"requestId\":\"{}\"}}", task.id);
                    let _ = out.send(WorkerEvent::Message(id, WorkerMessage::processed(Some(result))));
                    let _ = out.send(WorkerEvent::Message(id, WorkerMessage::idling()));
                }
            });

            Ok(Box::new(FakeHandle {
                id,
                tasks,
                events,
                worker,
            }))
        }
    }

    fn config(ceiling: usize, cache_limit: usize) -> PoolConfig {
        PoolConfig {
            ceiling,
            cache_limit,
            heartbeat_timeout: Duration::from_secs(30),
            spawn_retries: 2,
            startup_timeout: Duration::from_secs(1),
            warning_threshold: 0.7,
            critical_threshold: 0.9,
        }
    }

    async fn next_processed(notices: &mut mpsc::UnboundedReceiver<PoolNotice>) -> (Task, Option<String>) {
        loop {
            match notices.recv().await {
                Some(PoolNotice::TaskProcessed { task, result }) => return (*task, result),
                Some(PoolNotice::ReadyForNextTask) => continue,
                None => panic!("pool closed"),
            }
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_health_thresholds() {
        assert_eq!(PoolHealth::from_load(0.5, 0.7, 0.9), PoolHealth::Good);
        assert_eq!(PoolHealth::from_load(0.7, 0.7, 0.9), PoolHealth::Good);
        assert_eq!(PoolHealth::from_load(0.75, 0.7, 0.9), PoolHealth::Warning);
        assert_eq!(PoolHealth::from_load(1.0, 0.7, 0.9), PoolHealth::Critical);
    }

    #[test]
    fn test_kill_reason_messages() {
        assert_eq!(
            KillReason::TaskTimeout(Duration::from_millis(100)).to_string(),
            "Worker expired due to task timeout (100ms)"
        );
        let heartbeat = KillReason::HeartbeatTimeout {
            timeout: Duration::from_secs(30),
            elapsed: Duration::from_millis(30500),
            details: "appId: A".into(),
        };
        assert_eq!(
            heartbeat.to_string(),
            "Worker expired due to heartbeat timeout (30000ms), the last ping was 30500ms ago [appId: A]"
        );
        assert_eq!(heartbeat.label(), "heartbeat_timeout");
    }

    #[tokio::test]
    async fn test_acquire_marks_worker_busy() {
        let (pool, _notices) = WorkerPool::new(config(2, 0), Arc::new(FakeLauncher::default()));

        let first = pool.acquire("A", false).await.unwrap();
        let second = pool.acquire("A", false).await.unwrap();
        assert_ne!(first, second);

        let stats = pool.stats().await;
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.load, "100.00%");
        assert_eq!(stats.status, PoolHealth::Critical);
    }

    #[tokio::test]
    async fn test_spawned_worker_comes_back_busy() {
        let (pool, _notices) = WorkerPool::new(config(2, 2), Arc::new(FakeLauncher::default()));

        let worker = pool.acquire("A", true).await.unwrap();
        let info = pool.worker(worker).await.unwrap();
        assert_eq!(info.membership, Membership::Busy);
        assert_eq!(info.tenant.as_deref(), Some("A"));

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 1);
    }

    #[tokio::test]
    async fn test_reservation_holds_a_slot_until_dropped() {
        let (pool, _notices) = WorkerPool::new(config(1, 0), Arc::new(FakeLauncher::default()));

        let held = pool.reserve().await.unwrap();
        assert_eq!(pool.available_slots().await, 0);

        let waiting = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.reserve().await.map(|_| ()) }
        });
        settle().await;
        assert!(!waiting.is_finished());

        drop(held);
        waiting.await.unwrap().unwrap();
        assert_eq!(pool.available_slots().await, 1);
    }

    #[tokio::test]
    async fn test_busy_workers_and_reservations_share_the_ceiling() {
        let (pool, _notices) = WorkerPool::new(config(2, 0), Arc::new(FakeLauncher::default()));

        let _worker = pool.acquire("A", false).await.unwrap();
        let _held = pool.reserve().await.unwrap();
        assert_eq!(pool.available_slots().await, 0);
        assert_eq!(pool.stats().await.busy, 1);
    }

    #[tokio::test]
    async fn test_drain_wakes_waiting_reservations() {
        let (pool, _notices) = WorkerPool::new(config(1, 0), Arc::new(FakeLauncher::default()));

        let _held = pool.reserve().await.unwrap();
        let waiting = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.reserve().await.map(|_| ()) }
        });
        settle().await;

        pool.drain().await;
        assert!(matches!(waiting.await.unwrap(), Err(PoolError::Draining)));
        assert!(matches!(pool.reserve().await, Err(PoolError::Draining)));
    }

    #[tokio::test]
    async fn test_cacheable_worker_is_reused_by_tenant() {
        let launcher = Arc::new(FakeLauncher::default());
        let (pool, mut notices) = WorkerPool::new(config(2, 4), launcher.clone());

        let mut task = Task::handler("A", 100, "Orders");
        task.prepare(true);
        let worker = pool.acquire("A", true).await.unwrap();
        pool.dispatch(task.clone(), worker).await.unwrap();
        next_processed(&mut notices).await;
        settle().await;

        assert_eq!(pool.worker(worker).await.unwrap().membership, Membership::Cached);

        let again = pool.acquire("A", true).await.unwrap();
        assert_eq!(again, worker);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);

        let other = pool.acquire("B", true).await.unwrap();
        assert_ne!(other, worker);
    }

    #[tokio::test]
    async fn test_non_cacheable_worker_is_killed_at_idling() {
        let (pool, mut notices) = WorkerPool::new(config(2, 4), Arc::new(FakeLauncher::default()));

        let worker = pool.acquire("A", false).await.unwrap();
        pool.dispatch(Task::action("A", "ANALYSE_SERVER_CODE"), worker)
            .await
            .unwrap();
        next_processed(&mut notices).await;
        settle().await;

        assert!(pool.worker(worker).await.is_none());
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_full_cache_evicts_least_recent() {
        let (pool, mut notices) = WorkerPool::new(config(2, 1), Arc::new(FakeLauncher::default()));

        let mut first_task = Task::handler("A", 1, "X");
        first_task.prepare(true);
        let first = pool.acquire("A", true).await.unwrap();
        pool.dispatch(first_task, first).await.unwrap();
        next_processed(&mut notices).await;
        settle().await;

        let mut second_task = Task::handler("B", 1, "X");
        second_task.prepare(true);
        let second = pool.acquire("B", true).await.unwrap();
        assert!(pool.worker(first).await.is_none());

        pool.dispatch(second_task, second).await.unwrap();
        next_processed(&mut notices).await;
        settle().await;
        assert_eq!(pool.stats().await.cached, 1);
    }

    #[tokio::test]
    async fn test_spawn_failures_are_retried() {
        let launcher = Arc::new(FakeLauncher {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let (pool, _notices) = WorkerPool::new(config(1, 0), launcher.clone());

        assert!(pool.acquire("A", false).await.is_ok());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_spawn_exhaustion_is_provisioning_error() {
        let launcher = Arc::new(FakeLauncher {
            failures_left: AtomicUsize::new(10),
            ..Default::default()
        });
        let (pool, _notices) = WorkerPool::new(config(1, 0), launcher);

        assert!(matches!(
            pool.acquire("A", false).await,
            Err(PoolError::Provisioning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_kills_worker_after_grace() {
        let launcher = Arc::new(FakeLauncher {
            delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let (pool, _notices) = WorkerPool::new(config(1, 1), launcher);

        let worker = pool.acquire("A", true).await.unwrap();
        pool.dispatch(Task::handler("A", 1, "X").with_timeout(100), worker)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(pool.worker(worker).await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.worker(worker).await.is_none());
        assert_eq!(pool.available_slots().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_is_killed_mid_task() {
        let launcher = Arc::new(FakeLauncher {
            delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let mut cfg = config(1, 0);
        cfg.heartbeat_timeout = Duration::from_secs(2);
        let (pool, _notices) = WorkerPool::new(cfg, launcher);

        let worker = pool.acquire("A", false).await.unwrap();
        pool.dispatch(Task::service("A", "echo", "ping"), worker)
            .await
            .unwrap();
        assert_eq!(pool.stats().await.busy, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(pool.worker(worker).await.is_none());
        assert_eq!(pool.stats().await.busy, 0);
    }

    #[tokio::test]
    async fn test_purge_kills_cached_and_flags_busy() {
        let (pool, mut notices) = WorkerPool::new(config(3, 4), Arc::new(FakeLauncher::default()));

        let mut task = Task::handler("A", 1, "X");
        task.prepare(true);
        let cached = pool.acquire("A", true).await.unwrap();
        pool.dispatch(task.clone(), cached).await.unwrap();
        next_processed(&mut notices).await;
        settle().await;

        let busy = pool.acquire("A", true).await.unwrap();
        assert_eq!(busy, cached);
        let other = pool.acquire("A", true).await.unwrap();
        pool.purge_tenant("A", "redeployed").await;

        let info = pool.worker(busy).await.unwrap();
        assert!(info.to_be_removed);
        assert!(pool.worker(other).await.unwrap().to_be_removed);
    }

    #[tokio::test]
    async fn test_draining_refuses_acquire() {
        let (pool, _notices) = WorkerPool::new(config(1, 0), Arc::new(FakeLauncher::default()));
        pool.drain().await;

        assert!(matches!(pool.acquire("A", false).await, Err(PoolError::Draining)));
        assert_eq!(pool.available_slots().await, 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_busy_workers() {
        let launcher = Arc::new(FakeLauncher {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let (pool, _notices) = WorkerPool::new(config(1, 0), launcher);

        let worker = pool.acquire("A", false).await.unwrap();
        pool.dispatch(Task::service("A", "echo", "ping"), worker)
            .await
            .unwrap();

        pool.drain().await;
        assert_eq!(pool.stats().await.busy, 0);

        pool.shutdown().await;
        assert_eq!(pool.stats().await.total, 0);
    }
}
