//! Worker process loop: handshake, heartbeats and one task at a time over
//! newline-delimited JSON

use foreman_core::message::{decode_line, encode_line};
use foreman_core::task::short_class_name;
use foreman_core::{MasterMessage, Task, WorkerMessage};
use foreman_telemetry::TaskLogContext;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::WorkerResult;

/// Runs the worker side of the IPC channel until the master closes it
pub struct WorkerRuntime<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
    dispatcher: Dispatcher,
    heartbeat: Duration,
}

impl<R, W> WorkerRuntime<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, dispatcher: Dispatcher, heartbeat: Duration) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            dispatcher,
            heartbeat,
        }
    }

    /// Announce startup, then serve tasks; returns when stdin closes or a shutdown is requested
    pub async fn run(mut self) -> WorkerResult<()> {
        send(&mut self.writer, &WorkerMessage::started()).await?;
        info!("Worker started");

        let mut ticker = heartbeat_ticker(self.heartbeat);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    send(&mut self.writer, &WorkerMessage::heartbeat()).await?;
                }
                line = self.lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Master closed the channel, exiting");
                        return Ok(());
                    };

                    let task = match decode_line::<MasterMessage>(&line) {
                        Ok(MasterMessage::Task(task)) => *task,
                        Err(e) => {
                            warn!("Ignoring message from master: {}", e);
                            continue;
                        }
                    };

                    if !self.process(task, &mut ticker).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run one task while keeping the heartbeat going; false once the worker should exit
    async fn process(&mut self, task: Task, ticker: &mut Interval) -> WorkerResult<bool> {
        let task_id = task.id.clone();
        debug!("[{}] Processing started: {}", task_id, task.details());
        let started = Instant::now();

        let span = TaskLogContext::new(
            task_id.as_str(),
            short_class_name(task.kind.class_name()),
            &task.application_id,
        )
        .span();
        let run = self.dispatcher.dispatch(task).instrument(span);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = ticker.tick() => {
                    send(&mut self.writer, &WorkerMessage::heartbeat()).await?;
                }
            }
        };

        info!(
            "[{}] Processing finished in {}ms",
            task_id,
            started.elapsed().as_millis()
        );

        match outcome {
            Outcome::Processed(task_result) => {
                send(&mut self.writer, &WorkerMessage::processed(task_result)).await?;
                send(&mut self.writer, &WorkerMessage::idling()).await?;
                Ok(true)
            }
            Outcome::Shutdown => Ok(false),
        }
    }
}

fn heartbeat_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &WorkerMessage) -> WorkerResult<()> {
    writer.write_all(&encode_line(message)?).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{EchoService, SleepService};
    use crate::model::{StaticModel, StaticModelLoader};
    use crate::sandbox::NoSandbox;
    use foreman_core::task::SHUTDOWN_ACTION;
    use foreman_core::{args, InvocationResult, WorkerRunOptions};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    struct Harness {
        to_worker: DuplexStream,
        from_worker: Lines<BufReader<DuplexStream>>,
        handle: JoinHandle<WorkerResult<()>>,
    }

    impl Harness {
        fn spawn(heartbeat: Duration) -> Self {
            let (to_worker, worker_stdin) = duplex(64 * 1024);
            let (worker_stdout, from_worker) = duplex(64 * 1024);

            let mut model = StaticModel::new();
            model
                .register_service(Arc::new(EchoService))
                .register_service(Arc::new(SleepService));
            let dispatcher = Dispatcher::new(
                WorkerRunOptions::default(),
                Arc::new(StaticModelLoader::new(model)),
                Arc::new(NoSandbox),
            );

            let runtime = WorkerRuntime::new(worker_stdin, worker_stdout, dispatcher, heartbeat);

            Self {
                to_worker,
                from_worker: BufReader::new(from_worker).lines(),
                handle: tokio::spawn(runtime.run()),
            }
        }

        async fn send_task(&mut self, task: Task) {
            let line = encode_line(&MasterMessage::Task(Box::new(task))).unwrap();
            self.to_worker.write_all(&line).await.unwrap();
        }

        async fn next(&mut self) -> Option<WorkerMessage> {
            let line = self.from_worker.next_line().await.unwrap()?;
            Some(decode_line(&line).unwrap())
        }
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        let mut worker = Harness::spawn(Duration::from_secs(60));
        assert_eq!(worker.next().await, Some(WorkerMessage::started()));

        let task = Task::service("app", "echo", "ping")
            .with_id("t-1")
            .with_arguments(args::encode_json(json!(["hi"])).unwrap());
        worker.send_task(task).await;

        let Some(WorkerMessage::Processed { processed, task_result }) = worker.next().await else {
            panic!("expected processed");
        };
        assert!(processed);
        let result: InvocationResult = serde_json::from_str(&task_result.unwrap()).unwrap();
        assert_eq!(result.request_id, "t-1");
        assert!(result.exception.is_none());

        assert_eq!(worker.next().await, Some(WorkerMessage::idling()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_while_idle_and_busy() {
        let mut worker = Harness::spawn(Duration::from_secs(1));
        assert_eq!(worker.next().await, Some(WorkerMessage::started()));
        assert_eq!(worker.next().await, Some(WorkerMessage::heartbeat()));

        let task = Task::service("app", "sleep", "run")
            .with_arguments(args::encode_json(json!([3500])).unwrap());
        worker.send_task(task).await;

        let mut heartbeats = 0;
        loop {
            match worker.next().await {
                Some(WorkerMessage::Signal(foreman_core::WorkerSignal::Heartbeat)) => heartbeats += 1,
                Some(WorkerMessage::Processed { .. }) => break,
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(heartbeats >= 3);
        assert_eq!(worker.next().await, Some(WorkerMessage::idling()));
    }

    #[tokio::test]
    async fn test_garbage_is_ignored_and_eof_exits() {
        let mut worker = Harness::spawn(Duration::from_secs(60));
        assert_eq!(worker.next().await, Some(WorkerMessage::started()));

        worker.to_worker.write_all(b"not json\n").await.unwrap();
        worker.send_task(Task::service("app", "echo", "ping")).await;
        assert!(matches!(worker.next().await, Some(WorkerMessage::Processed { .. })));
        assert_eq!(worker.next().await, Some(WorkerMessage::idling()));

        drop(worker.to_worker);
        assert!(worker.handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_action_exits_without_result() {
        let mut worker = Harness::spawn(Duration::from_secs(60));
        assert_eq!(worker.next().await, Some(WorkerMessage::started()));

        worker.send_task(Task::action("app", SHUTDOWN_ACTION)).await;

        assert_eq!(worker.next().await, None);
        assert!(worker.handle.await.unwrap().is_ok());
    }
}
