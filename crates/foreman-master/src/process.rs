//! Worker subprocesses and the channel the pool talks to them through

use async_trait::async_trait;
use foreman_core::config::RUN_OPTIONS_ENV;
use foreman_core::message::{decode_line, encode_line};
use foreman_core::{MasterMessage, WorkerMessage, WorkerRunOptions};
use foreman_telemetry::WorkerLogContext;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use crate::error::{PoolError, PoolResult};
use crate::pool::WorkerId;

/// What the pool hears from its workers
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerId, WorkerMessage),
    /// The worker's output closed; it is gone
    Exited(WorkerId),
}

/// Master side of one worker
pub trait WorkerHandle: Send + Sync {
    /// OS process id, when the worker is a real process
    fn pid(&self) -> Option<u32>;

    /// Queue a message for the worker
    fn send(&self, message: &MasterMessage) -> PoolResult<()>;

    /// Terminate the worker immediately
    fn kill(&mut self);
}

/// Starts workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start worker `id`; everything it says is forwarded to `events`
    async fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> PoolResult<Box<dyn WorkerHandle>>;
}

/// Launches the worker binary as a child process
pub struct ProcessLauncher {
    binary: PathBuf,
    run_options: String,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>, options: &WorkerRunOptions) -> PoolResult<Self> {
        let run_options = options
            .to_env_value()
            .map_err(|e| PoolError::Provisioning(e.to_string()))?;

        Ok(Self {
            binary: binary.into(),
            run_options,
        })
    }

    /// `foreman-worker` next to the running executable
    pub fn default_binary() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("foreman-worker")))
            .unwrap_or_else(|| PathBuf::from("foreman-worker"))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> PoolResult<Box<dyn WorkerHandle>> {
        let mut child = Command::new(&self.binary)
            .env(RUN_OPTIONS_ENV, &self.run_options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PoolError::Provisioning(format!("{}: {}", self.binary.display(), e))
            })?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(PoolError::Provisioning("worker pipes unavailable".to_string()));
        };

        let pid = child.id();
        let span = WorkerLogContext::new(&id.to_string(), pid).span();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = stdin.write_all(&line).await {
                    debug!("Worker {} stdin closed: {}", id, e);
                    break;
                }
            }
        });

        let reader = async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line::<WorkerMessage>(&line) {
                        Ok(message) => {
                            let _ = events.send(WorkerEvent::Message(id, message));
                        }
                        Err(e) => warn!("[{}] Unreadable worker output: {}", id, e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[{}] Worker output failed: {}", id, e);
                        break;
                    }
                }
            }
            debug!("Worker output closed");
            let _ = events.send(WorkerEvent::Exited(id));
        };
        tokio::spawn(reader.instrument(span));

        Ok(Box::new(ProcessHandle {
            id,
            pid,
            child: Some(child),
            stdin: tx,
        }))
    }
}

struct ProcessHandle {
    id: WorkerId,
    pid: Option<u32>,
    child: Option<Child>,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&self, message: &MasterMessage) -> PoolResult<()> {
        let line = encode_line(message).map_err(|e| PoolError::Dispatch {
            worker: self.id,
            reason: e.to_string(),
        })?;

        self.stdin.send(line).map_err(|_| PoolError::Dispatch {
            worker: self.id,
            reason: "worker stdin is closed".to_string(),
        })
    }

    fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.start_kill() {
            debug!("[{}] Kill failed: {}", self.id, e);
        }
        // reap
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }
}
