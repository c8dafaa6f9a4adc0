//! Task and result codec on top of a transport

use crate::traits::{Broker, BrokerError, BrokerEvent, BrokerResult, ControlMessage};
use foreman_core::compression;
use foreman_core::config::CompressionConfig;
use foreman_core::Task;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Broker client used by the master
#[derive(Clone)]
pub struct BrokerClient {
    broker: Arc<dyn Broker>,
    compression: CompressionConfig,
}

impl BrokerClient {
    pub fn new(broker: Arc<dyn Broker>, compression: CompressionConfig) -> Self {
        Self { broker, compression }
    }

    /// Underlying transport
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Frame a task the way producers put it on a channel
    pub fn encode_task(&self, task: &Task) -> BrokerResult<Vec<u8>> {
        let json = serde_json::to_vec(task).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.encode(json)
    }

    fn encode(&self, payload: Vec<u8>) -> BrokerResult<Vec<u8>> {
        if self.compression.enabled {
            Ok(compression::compress(&payload, &self.compression)?)
        } else {
            Ok(payload)
        }
    }

    /// Wait for the next task on `channel`
    pub async fn next_task(&self, channel: &str) -> BrokerResult<Task> {
        let payload = self.broker.dequeue(channel).await?;
        self.decode_task(channel, payload)
    }

    /// Wait at most `wait` for a task on `channel`
    pub async fn poll_task(&self, channel: &str, wait: Duration) -> BrokerResult<Option<Task>> {
        match self.broker.poll(channel, wait).await? {
            Some(payload) => self.decode_task(channel, payload).map(Some),
            None => Ok(None),
        }
    }

    fn decode_task(&self, channel: &str, payload: Vec<u8>) -> BrokerResult<Task> {
        let json = if self.compression.enabled {
            compression::decompress(&payload)?
        } else {
            payload
        };

        let task: Task =
            serde_json::from_slice(&json).map_err(|e| BrokerError::Serialization(e.to_string()))?;

        debug!("Received task {} from {}", task.id, channel);
        Ok(task)
    }

    /// Publish a task's result on its response channel
    pub async fn send_result(&self, task: &Task, result: &str) -> BrokerResult<()> {
        if task.response_channel_id.is_empty() {
            warn!("Task {} has no response channel, dropping its result", task.id);
            return Ok(());
        }

        let payload = self.encode(result.as_bytes().to_vec())?;
        self.broker.publish(&task.response_channel_id, payload).await
    }

    /// Keep the session key alive
    pub async fn renew_session(&self, key: &str, ttl: Duration) -> BrokerResult<()> {
        self.broker.expire(key, ttl).await
    }

    pub async fn subscribe(&self, channel: &str) -> BrokerResult<mpsc::UnboundedReceiver<ControlMessage>> {
        self.broker.subscribe(channel).await
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.broker.events()
    }

    pub async fn stop_dequeue(&self) {
        self.broker.stop_dequeue().await
    }

    pub async fn stop_publish(&self) {
        self.broker.stop_publish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn client(broker: &MemoryBroker, enabled: bool) -> BrokerClient {
        let compression = CompressionConfig {
            enabled,
            ..Default::default()
        };
        BrokerClient::new(Arc::new(broker.clone()), compression)
    }

    #[tokio::test]
    async fn test_next_task_decodes_compressed_envelope() {
        let broker = MemoryBroker::new();
        let client = client(&broker, true);

        let task = Task::handler("app", 100, "Users")
            .with_arguments("a".repeat(2000).into_bytes())
            .with_response_channel("resp");
        let payload = client.encode_task(&task).unwrap();
        assert_eq!(payload[0], compression::MARK_DEFLATED);
        broker.push("tasks", payload);

        assert_eq!(client.next_task("tasks").await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_next_task_without_compression() {
        let broker = MemoryBroker::new();
        let client = client(&broker, false);
        let task = Task::action("app", "ANALYSE_SERVER_CODE");
        broker.push("tasks", serde_json::to_vec(&task).unwrap());
        assert_eq!(client.next_task("tasks").await.unwrap(), task);
    }

    #[tokio::test]
    async fn test_corrupt_task_is_serialization_error() {
        let broker = MemoryBroker::new();
        let client = client(&broker, true);

        broker.push("tasks", vec![0x09, 1, 2, 3]);
        assert!(matches!(
            client.next_task("tasks").await,
            Err(BrokerError::Serialization(_))
        ));

        broker.push("tasks", b"\x00{not json".to_vec());
        assert!(matches!(
            client.next_task("tasks").await,
            Err(BrokerError::Serialization(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_task() {
        let broker = MemoryBroker::new();
        let client = client(&broker, true);
        assert!(client
            .poll_task("lp", Duration::from_millis(500))
            .await
            .unwrap()
            .is_none());

        let task = Task::service("app", "S", "m");
        broker.push("lp", client.encode_task(&task).unwrap());
        assert_eq!(
            client.poll_task("lp", Duration::from_millis(500)).await.unwrap(),
            Some(task)
        );
    }

    #[tokio::test]
    async fn test_send_result_uses_response_channel() {
        let broker = MemoryBroker::new();
        let client = client(&broker, true);
        let task = Task::service("app", "S", "m").with_response_channel("resp-7");

        client.send_result(&task, "{\"ok\":true}").await.unwrap();

        let published = broker.published("resp-7");
        assert_eq!(published.len(), 1);
        assert_eq!(
            compression::decompress(&published[0]).unwrap(),
            b"{\"ok\":true}"
        );
    }

    #[tokio::test]
    async fn test_renew_session_propagates_key_not_found() {
        let broker = MemoryBroker::new();
        let client = client(&broker, false);
        assert!(matches!(
            client.renew_session("s", Duration::from_secs(10)).await,
            Err(BrokerError::KeyNotFound(_))
        ));
    }
}
