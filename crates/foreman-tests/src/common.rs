//! Common test utilities and fixtures

use async_trait::async_trait;
use foreman_broker::{BrokerClient, MemoryBroker};
use foreman_core::config::CompressionConfig;
use foreman_core::message::{decode_line, encode_line};
use foreman_core::{args, compression, InvocationResult, MasterMessage, Task, WorkerMessage};
use foreman_master::{
    PoolConfig, PoolError, PoolResult, Scheduler, SchedulerConfig, SchedulerError, WorkerEvent,
    WorkerHandle, WorkerId, WorkerLauncher, WorkerPool,
};
use foreman_worker::{
    Dispatcher, EchoService, FailService, NoSandbox, SleepService, StaticModel, StaticModelLoader,
    WorkerRuntime,
};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

/// Initialize test environment (logging, etc.)
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("foreman=debug")
            .try_init();
    });
}

/// Generate a unique test queue name
pub fn unique_queue(prefix: &str) -> String {
    format!("{}_{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Poll `check` every 10ms until it holds; panics after ten seconds
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Service task for the built-in `sleep` service
pub fn sleep_task(tenant: &str, millis: u64) -> Task {
    Task::service(tenant, "sleep", "run")
        .with_arguments(args::encode_json(json!([millis])).unwrap_or_default())
        .with_response_channel(format!("resp-{}", tenant))
}

/// Service task for the built-in `echo` service
pub fn echo_task(tenant: &str, word: &str) -> Task {
    Task::service(tenant, "echo", "ping")
        .with_arguments(args::encode_json(json!([word])).unwrap_or_default())
        .with_response_channel(format!("resp-{}", tenant))
}

/// Launch, kill and concurrency counters shared by the test launchers
#[derive(Debug, Default)]
pub struct LaunchStats {
    launched: AtomicUsize,
    alive: AtomicUsize,
    peak: AtomicUsize,
}

impl LaunchStats {
    fn started(&self) {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(alive, Ordering::SeqCst);
    }

    /// Count a worker as gone once, whether it was killed or its pipe closed
    fn stopped(&self, running: &AtomicBool) {
        if running.swap(false, Ordering::SeqCst) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Workers started so far
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Workers currently running
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Most workers ever running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Model served by in-process workers: the built-in echo, sleep and fail services
pub fn builtin_model() -> StaticModel {
    let mut model = StaticModel::new();
    model
        .register_service(Arc::new(EchoService))
        .register_service(Arc::new(SleepService))
        .register_service(Arc::new(FailService));
    model
}

/// Runs each worker as a [`WorkerRuntime`] task wired to the pool through in-memory pipes
pub struct InProcessLauncher {
    heartbeat: Duration,
    startup_delay: Duration,
    pub stats: Arc<LaunchStats>,
}

impl InProcessLauncher {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat,
            startup_delay: Duration::ZERO,
            stats: Arc::default(),
        }
    }

    /// Workers that take `delay` to come up, like a cold interpreter would
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

struct PipeHandle {
    id: WorkerId,
    lines: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<LaunchStats>,
}

impl WorkerHandle for PipeHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&self, message: &MasterMessage) -> PoolResult<()> {
        let line = encode_line(message).map_err(|e| PoolError::Dispatch {
            worker: self.id,
            reason: e.to_string(),
        })?;
        self.lines.send(line).map_err(|_| PoolError::Dispatch {
            worker: self.id,
            reason: "pipe closed".to_string(),
        })
    }

    fn kill(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.stats.stopped(&self.running);
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> PoolResult<Box<dyn WorkerHandle>> {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }

        let (mut to_worker, worker_stdin) = duplex(64 * 1024);
        let (worker_stdout, from_worker) = duplex(64 * 1024);

        let dispatcher = Dispatcher::new(
            Default::default(),
            Arc::new(StaticModelLoader::new(builtin_model())),
            Arc::new(NoSandbox),
        );
        let runtime = WorkerRuntime::new(worker_stdin, worker_stdout, dispatcher, self.heartbeat);

        self.stats.started();
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::clone(&self.stats);
        let alive = Arc::clone(&running);
        let worker = tokio::spawn(async move {
            let _ = runtime.run().await;
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(from_worker).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(message) = decode_line::<WorkerMessage>(&line) {
                    let _ = events.send(WorkerEvent::Message(id, message));
                }
            }
            stats.stopped(&alive);
            let _ = events.send(WorkerEvent::Exited(id));
        });

        let (lines, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if to_worker.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(PipeHandle {
            id,
            lines,
            tasks: vec![worker, writer],
            running,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Workers that handshake and keep heartbeating but never finish a task
pub struct HungLauncher {
    heartbeat: Duration,
    pub stats: Arc<LaunchStats>,
}

impl HungLauncher {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat,
            stats: Arc::default(),
        }
    }
}

struct HungHandle {
    id: WorkerId,
    worker: JoinHandle<()>,
    running: AtomicBool,
    stats: Arc<LaunchStats>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle for HungHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&self, _message: &MasterMessage) -> PoolResult<()> {
        Ok(())
    }

    fn kill(&mut self) {
        self.worker.abort();
        if self.running.load(Ordering::SeqCst) {
            self.stats.stopped(&self.running);
            let _ = self.events.send(WorkerEvent::Exited(self.id));
        }
    }
}

#[async_trait]
impl WorkerLauncher for HungLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> PoolResult<Box<dyn WorkerHandle>> {
        self.stats.started();

        let out = events.clone();
        let heartbeat = self.heartbeat;
        let worker = tokio::spawn(async move {
            let _ = out.send(WorkerEvent::Message(id, WorkerMessage::started()));
            loop {
                tokio::time::sleep(heartbeat).await;
                if out
                    .send(WorkerEvent::Message(id, WorkerMessage::heartbeat()))
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(Box::new(HungHandle {
            id,
            worker,
            running: AtomicBool::new(true),
            stats: Arc::clone(&self.stats),
            events,
        }))
    }
}

/// A master wired to an in-memory broker
pub struct TestMaster {
    pub broker: MemoryBroker,
    pub client: BrokerClient,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: CancellationToken,
    handle: JoinHandle<Result<(), SchedulerError>>,
}

impl TestMaster {
    pub fn start(
        pool: PoolConfig,
        scheduler: SchedulerConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        init();

        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()), CompressionConfig::default());
        let (pool, notices) = WorkerPool::new(pool, launcher);
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(scheduler, client.clone(), Arc::clone(&pool), shutdown.clone());
        let handle = tokio::spawn(Arc::clone(&scheduler).run(notices));

        Self {
            broker,
            client,
            pool,
            scheduler,
            shutdown,
            handle,
        }
    }

    /// Put a task on `channel` the way a producer would
    pub fn submit(&self, channel: &str, task: &Task) {
        let payload = self.client.encode_task(task).unwrap_or_default();
        self.broker.push(channel, payload);
    }

    /// Wait for `count` results on `channel` and decode them
    pub async fn results(&self, channel: &str, count: usize) -> Vec<InvocationResult> {
        self.broker
            .wait_published(channel, count)
            .await
            .iter()
            .map(|envelope| decode_result(envelope))
            .collect()
    }

    /// Graceful shutdown; returns what the scheduler returned
    pub async fn stop(self) -> Result<(), SchedulerError> {
        self.shutdown.cancel();
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => panic!("scheduler task failed: {}", e),
        }
    }
}

/// Decode a published result envelope
pub fn decode_result(envelope: &[u8]) -> InvocationResult {
    let json = compression::decompress(envelope).expect("valid envelope");
    serde_json::from_slice(&json).expect("valid invocation result")
}

/// Pool settings for scenarios: short startup timeout, no retries
pub fn pool_config(ceiling: usize, cache_limit: usize) -> PoolConfig {
    PoolConfig {
        ceiling,
        cache_limit,
        heartbeat_timeout: Duration::from_secs(30),
        spawn_retries: 1,
        startup_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}
