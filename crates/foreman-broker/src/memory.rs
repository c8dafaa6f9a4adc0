//! In-process transport for local runs and tests

use crate::traits::{Broker, BrokerError, BrokerEvent, BrokerResult, ControlMessage};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<Vec<u8>>>,
    ready: Notify,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Arc<Queue>>,
    published: HashMap<String, Vec<Vec<u8>>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<ControlMessage>>>,
    keys: HashSet<String>,
}

struct Inner {
    state: Mutex<State>,
    published: Notify,
    events: broadcast::Sender<BrokerEvent>,
    dequeue_stop: CancellationToken,
    publish_stop: CancellationToken,
}

/// Broker backed by in-process queues
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                published: Notify::new(),
                events,
                dequeue_stop: CancellationToken::new(),
                publish_stop: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self, channel: &str) -> Arc<Queue> {
        self.state()
            .queues
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    /// Append a payload to the tail of `channel`
    pub fn push(&self, channel: &str, payload: Vec<u8>) {
        let queue = self.queue(channel);
        queue
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(payload);
        queue.ready.notify_one();
    }

    /// Number of payloads waiting on `channel`
    pub fn pending(&self, channel: &str) -> usize {
        self.queue(channel)
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Everything published on `channel` so far
    pub fn published(&self, channel: &str) -> Vec<Vec<u8>> {
        self.state().published.get(channel).cloned().unwrap_or_default()
    }

    /// Total number of publishes across all channels
    pub fn published_count(&self) -> usize {
        self.state().published.values().map(Vec::len).sum()
    }

    /// Wait until at least `count` payloads were published on `channel`
    pub async fn wait_published(&self, channel: &str, count: usize) -> Vec<Vec<u8>> {
        loop {
            let notified = self.inner.published.notified();
            let published = self.published(channel);
            if published.len() >= count {
                return published;
            }
            notified.await;
        }
    }

    /// Create a key so that `expire` on it succeeds
    pub fn set_key(&self, key: &str) {
        self.state().keys.insert(key.to_string());
    }

    pub fn remove_key(&self, key: &str) {
        self.state().keys.remove(key);
    }

    /// Broadcast a connectivity event as a real transport would
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn dequeue(&self, channel: &str) -> BrokerResult<Vec<u8>> {
        let queue = self.queue(channel);

        loop {
            if self.inner.dequeue_stop.is_cancelled() {
                return Err(BrokerError::Stopped);
            }

            let popped = queue
                .items
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            if let Some(payload) = popped {
                return Ok(payload);
            }

            tokio::select! {
                _ = self.inner.dequeue_stop.cancelled() => return Err(BrokerError::Stopped),
                _ = queue.ready.notified() => {}
            }
        }
    }

    async fn poll(&self, channel: &str, wait: Duration) -> BrokerResult<Option<Vec<u8>>> {
        match tokio::time::timeout(wait, self.dequeue(channel)).await {
            Ok(payload) => payload.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BrokerResult<()> {
        if self.inner.publish_stop.is_cancelled() {
            return Err(BrokerError::Stopped);
        }

        {
            let mut state = self.state();
            if let Some(senders) = state.subscribers.get_mut(channel) {
                let message = ControlMessage::parse(&String::from_utf8_lossy(&payload));
                senders.retain(|tx| tx.send(message.clone()).is_ok());
            }
            state
                .published
                .entry(channel.to_string())
                .or_default()
                .push(payload);
        }

        debug!("Published on {}", channel);
        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn expire(&self, key: &str, _ttl: Duration) -> BrokerResult<()> {
        if self.state().keys.contains(key) {
            Ok(())
        } else {
            Err(BrokerError::KeyNotFound(key.to_string()))
        }
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<mpsc::UnboundedReceiver<ControlMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    async fn stop_dequeue(&self) {
        self.inner.dequeue_stop.cancel();
    }

    async fn stop_publish(&self) {
        self.inner.dequeue_stop.cancel();
        self.inner.publish_stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let broker = MemoryBroker::new();
        broker.push("q", b"1".to_vec());
        broker.push("q", b"2".to_vec());
        assert_eq!(broker.dequeue("q").await.unwrap(), b"1");
        assert_eq!(broker.dequeue("q").await.unwrap(), b"2");
        assert_eq!(broker.pending("q"), 0);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_push() {
        let broker = MemoryBroker::new();
        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue("q").await })
        };
        tokio::task::yield_now().await;
        broker.push("q", b"late".to_vec());
        assert_eq!(waiting.await.unwrap().unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let broker = MemoryBroker::new();
        let blocked = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue("empty").await })
        };
        broker.push("full", b"x".to_vec());
        assert_eq!(broker.dequeue("full").await.unwrap(), b"x");
        blocked.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_wait() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.poll("q", Duration::from_secs(1)).await.unwrap(), None);

        broker.push("q", b"x".to_vec());
        assert_eq!(
            broker.poll("q", Duration::from_secs(1)).await.unwrap(),
            Some(b"x".to_vec())
        );
    }

    #[tokio::test]
    async fn test_stop_dequeue_releases_waiters() {
        let broker = MemoryBroker::new();
        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue("q").await })
        };
        tokio::task::yield_now().await;
        broker.stop_dequeue().await;
        assert!(matches!(waiting.await.unwrap(), Err(BrokerError::Stopped)));

        // publishing still works until stop_publish
        broker.publish("r", b"ok".to_vec()).await.unwrap();
        broker.stop_publish().await;
        assert!(matches!(
            broker.publish("r", b"no".to_vec()).await,
            Err(BrokerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_subscribers_get_each_message_once_in_order() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe("ctl").await.unwrap();
        broker.publish("ctl", br#"{"n":1}"#.to_vec()).await.unwrap();
        broker.publish("ctl", b"plain".to_vec()).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ControlMessage::Json(serde_json::json!({"n": 1}))
        );
        assert_eq!(rx.recv().await.unwrap(), ControlMessage::Raw("plain".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expire_requires_key() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.expire("session", Duration::from_secs(1)).await,
            Err(BrokerError::KeyNotFound(_))
        ));
        broker.set_key("session");
        assert!(broker.expire("session", Duration::from_secs(1)).await.is_ok());
    }
}
