//! Messages exchanged between the master and its workers
//!
//! Each message is one line of JSON on the worker's stdin (master to worker)
//! or stdout (worker to master).

use crate::{Error, Result, Task};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Master to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterMessage {
    /// Run a task
    Task(Box<Task>),
}

/// Lifecycle signals a worker sends as bare strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerSignal {
    /// Handshake after startup
    Started,
    /// Periodic liveness ping
    Heartbeat,
    /// Finished a task and ready for the next one
    Idling,
}

/// Worker to master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Signal(WorkerSignal),
    Processed {
        processed: bool,
        #[serde(rename = "taskResult")]
        task_result: Option<String>,
    },
}

impl WorkerMessage {
    pub fn started() -> Self {
        WorkerMessage::Signal(WorkerSignal::Started)
    }

    pub fn heartbeat() -> Self {
        WorkerMessage::Signal(WorkerSignal::Heartbeat)
    }

    pub fn idling() -> Self {
        WorkerMessage::Signal(WorkerSignal::Idling)
    }

    /// Task finished, with the result JSON if it produced one
    pub fn processed(task_result: Option<String>) -> Self {
        WorkerMessage::Processed {
            processed: true,
            task_result,
        }
    }
}

/// Encode a message as a newline-terminated JSON line
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line (trailing whitespace ignored)
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Err(Error::Ipc("empty message line".to_string()));
    }
    serde_json::from_str(trimmed).map_err(|e| Error::Ipc(format!("malformed message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_are_bare_strings() {
        assert_eq!(encode_line(&WorkerMessage::started()).unwrap(), b"\"started\"\n");
        assert_eq!(
            decode_line::<WorkerMessage>("\"heartbeat\"\n").unwrap(),
            WorkerMessage::heartbeat()
        );
        assert_eq!(
            decode_line::<WorkerMessage>("\"idling\"").unwrap(),
            WorkerMessage::idling()
        );
    }

    #[test]
    fn test_processed_shape() {
        let line = encode_line(&WorkerMessage::processed(Some("{}".into()))).unwrap();
        assert_eq!(line, b"{\"processed\":true,\"taskResult\":\"{}\"}\n");

        let none: WorkerMessage = decode_line(r#"{"processed":true,"taskResult":null}"#).unwrap();
        assert_eq!(none, WorkerMessage::processed(None));
    }

    #[test]
    fn test_task_envelope() {
        let task = Task::handler("app", 100, "Users").with_id("t-1");
        let line = encode_line(&MasterMessage::Task(Box::new(task.clone()))).unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(text.starts_with("{\"task\":{"));

        let MasterMessage::Task(decoded) = decode_line(&text).unwrap();
        assert_eq!(*decoded, task);
    }

    #[test]
    fn test_garbage_is_ipc_error() {
        assert!(matches!(
            decode_line::<WorkerMessage>("\"exploded\""),
            Err(Error::Ipc(_))
        ));
        assert!(matches!(decode_line::<WorkerMessage>("  \n"), Err(Error::Ipc(_))));
    }
}
