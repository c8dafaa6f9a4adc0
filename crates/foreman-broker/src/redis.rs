//! Redis transport
//!
//! - tasks are popped with `BLPOP`, each call on its own pooled connection
//! - results go out with `PUBLISH` on the shared pool
//! - control channels share a single subscriber connection
//!
//! A failed command marks the broker disconnected and starts a reconnection
//! loop; `Reconnected` is broadcast once a `PING` succeeds again.

use crate::traits::{
    reconnect_delay, Broker, BrokerError, BrokerEvent, BrokerResult, ControlMessage,
};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use foreman_core::config::BrokerConfig;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Connection = deadpool_redis::Connection;

/// Configuration for Redis broker
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Connection URL
    pub url: String,

    /// Pool size; needs one connection per dequeue channel plus one for publishing
    pub pool_size: usize,

    /// Timeout for establishing a connection
    pub connection_timeout: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 4,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

impl RedisBrokerConfig {
    /// Derive from the broker section, sizing the pool for `dequeue_channels` blocking pops
    pub fn from_config(config: &BrokerConfig, dequeue_channels: usize) -> Self {
        Self {
            url: config.url.clone(),
            pool_size: dequeue_channels + 2,
            connection_timeout: Duration::from_secs(config.connection_timeout),
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    senders: HashMap<String, Vec<mpsc::UnboundedSender<ControlMessage>>>,
    resubscribe: Option<mpsc::UnboundedSender<()>>,
}

struct Inner {
    client: redis::Client,
    pool: Pool,
    config: RedisBrokerConfig,
    events: broadcast::Sender<BrokerEvent>,
    subscriptions: Mutex<Subscriptions>,
    reconnecting: AtomicBool,
    dequeue_stop: CancellationToken,
    publish_stop: CancellationToken,
}

/// Redis broker implementation
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<Inner>,
}

impl RedisBroker {
    /// Connect with default settings
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let config = RedisBrokerConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::with_config(config).await
    }

    /// Create a new Redis broker with custom config
    pub async fn with_config(config: RedisBrokerConfig) -> BrokerResult<Self> {
        info!("Connection to Redis at {}...", config.url);

        let client =
            redis::Client::open(config.url.as_str()).map_err(|e| BrokerError::Connection(e.to_string()))?;

        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .create_timeout(Some(config.connection_timeout))
            .build()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (events, _) = broadcast::channel(16);

        let broker = Self {
            inner: Arc::new(Inner {
                client,
                pool,
                config,
                events,
                subscriptions: Mutex::new(Subscriptions::default()),
                reconnecting: AtomicBool::new(false),
                dequeue_stop: CancellationToken::new(),
                publish_stop: CancellationToken::new(),
            }),
        };

        broker.inner.ping().await?;
        info!("Connected to Redis broker at {}", broker.inner.config.url);

        Ok(broker)
    }
}

impl Inner {
    async fn get_conn(&self) -> BrokerResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Pool(e.to_string()))
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.get_conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Broadcast `Disconnected` and retry until the server answers again
    fn connection_lost(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.events.send(BrokerEvent::Disconnected);

        let inner = self.clone();
        tokio::spawn(async move {
            let mut attempt = 1;
            loop {
                let delay = reconnect_delay(attempt);
                info!("Redis: will try to reconnect in: {:?}", delay);

                tokio::select! {
                    _ = inner.publish_stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match inner.ping().await {
                    Ok(()) => {
                        info!("Connection with Redis has been restored");
                        inner.reconnecting.store(false, Ordering::SeqCst);
                        let _ = inner.events.send(BrokerEvent::Reconnected);
                        return;
                    }
                    Err(e) => {
                        debug!("Redis reconnection attempt {} failed: {}", attempt, e);
                        attempt += 1;
                    }
                }
            }
        });
    }

    fn check_command_error(self: &Arc<Self>, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            error!("Redis connection error: {}", err);
            self.connection_lost();
        }
    }

    /// `BLPOP` on its own connection; `timeout` in seconds, zero waits forever
    async fn blpop(self: &Arc<Self>, channel: &str, timeout: f64) -> BrokerResult<Option<Vec<u8>>> {
        if self.dequeue_stop.is_cancelled() {
            return Err(BrokerError::Stopped);
        }

        let mut conn = match self.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                self.connection_lost();
                return Err(e);
            }
        };

        let mut blpop = redis::cmd("BLPOP");
        blpop.arg(channel).arg(timeout);

        let popped = tokio::select! {
            _ = self.dequeue_stop.cancelled() => None,
            result = blpop.query_async::<_, Option<(String, Vec<u8>)>>(&mut *conn) => Some(result),
        };

        match popped {
            // A connection with a pending BLPOP must not go back to the pool
            None => {
                drop(Connection::take(conn));
                Err(BrokerError::Stopped)
            }
            Some(Ok(Some((_, payload)))) => {
                debug!("Received {} bytes from {}", payload.len(), channel);
                Ok(Some(payload))
            }
            Some(Ok(None)) => Ok(None),
            Some(Err(e)) => {
                self.check_command_error(&e);
                drop(Connection::take(conn));
                Err(BrokerError::Dequeue(e.to_string()))
            }
        }
    }

    async fn deliver(&self, msg: redis::Msg) {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping undecodable message on {}: {}", channel, e);
                return;
            }
        };

        let message = ControlMessage::parse(&payload);
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(senders) = subscriptions.senders.get_mut(&channel) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

/// Owns the subscriber connection; a resubscribe request rebuilds it with every known channel
async fn run_subscriber(inner: Arc<Inner>, mut resubscribe: mpsc::UnboundedReceiver<()>) {
    let mut attempt = 0;

    loop {
        if inner.publish_stop.is_cancelled() {
            return;
        }

        let channels: Vec<String> = inner
            .subscriptions
            .lock()
            .await
            .senders
            .keys()
            .cloned()
            .collect();

        let pubsub = match open_pubsub(&inner.client, &channels).await {
            Ok(pubsub) => {
                attempt = 0;
                pubsub
            }
            Err(e) => {
                attempt += 1;
                warn!("Redis subscriber connection failed: {}", e);
                tokio::select! {
                    _ = inner.publish_stop.cancelled() => return,
                    _ = tokio::time::sleep(reconnect_delay(attempt)) => continue,
                }
            }
        };

        debug!("Subscribed to {:?}", channels);
        let mut messages = pubsub.into_on_message();

        loop {
            tokio::select! {
                _ = inner.publish_stop.cancelled() => return,
                request = resubscribe.recv() => match request {
                    Some(()) => break,
                    None => return,
                },
                msg = messages.next() => match msg {
                    Some(msg) => inner.deliver(msg).await,
                    None => {
                        warn!("Redis subscriber connection lost");
                        break;
                    }
                },
            }
        }
    }
}

async fn open_pubsub(
    client: &redis::Client,
    channels: &[String],
) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    Ok(pubsub)
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn dequeue(&self, channel: &str) -> BrokerResult<Vec<u8>> {
        loop {
            if let Some(payload) = self.inner.blpop(channel, 0.0).await? {
                return Ok(payload);
            }
        }
    }

    async fn poll(&self, channel: &str, wait: Duration) -> BrokerResult<Option<Vec<u8>>> {
        // a zero timeout would block forever
        let seconds = wait.as_secs_f64().max(0.01);
        self.inner.blpop(channel, seconds).await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BrokerResult<()> {
        let inner = &self.inner;
        if inner.publish_stop.is_cancelled() {
            return Err(BrokerError::Stopped);
        }

        let mut conn = inner.get_conn().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                inner.check_command_error(&e);
                BrokerError::Publish(e.to_string())
            })?;

        debug!("Published result on {}", channel);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BrokerResult<()> {
        let inner = &self.inner;
        let mut conn = inner.get_conn().await?;
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                inner.check_command_error(&e);
                BrokerError::Internal(e.to_string())
            })?;

        if updated == 0 {
            return Err(BrokerError::KeyNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<mpsc::UnboundedReceiver<ControlMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriptions = self.inner.subscriptions.lock().await;

        let new_channel = !subscriptions.senders.contains_key(channel);
        subscriptions
            .senders
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        match &subscriptions.resubscribe {
            Some(resubscribe) if new_channel => resubscribe
                .send(())
                .map_err(|_| BrokerError::Internal("subscriber task has stopped".to_string()))?,
            Some(_) => {}
            None => {
                let (resubscribe, requests) = mpsc::unbounded_channel();
                subscriptions.resubscribe = Some(resubscribe);
                tokio::spawn(run_subscriber(self.inner.clone(), requests));
            }
        }

        info!("Subscribed to control channel {}", channel);
        Ok(rx)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    async fn stop_dequeue(&self) {
        debug!("Stopping Redis dequeue connections");
        self.inner.dequeue_stop.cancel();
    }

    async fn stop_publish(&self) {
        self.inner.dequeue_stop.cancel();
        self.inner.publish_stop.cancel();
        self.inner.pool.close();
        debug!("Redis publish connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance
    // Run with: cargo test --package foreman-broker -- --ignored

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_dequeue_in_push_order() {
        let broker = RedisBroker::connect("redis://localhost:6379").await.unwrap();
        let mut conn = broker.inner.get_conn().await.unwrap();
        let _: i64 = redis::cmd("RPUSH")
            .arg("foreman_test_queue")
            .arg("first")
            .arg("second")
            .query_async(&mut *conn)
            .await
            .unwrap();

        assert_eq!(broker.dequeue("foreman_test_queue").await.unwrap(), b"first");
        assert_eq!(broker.dequeue("foreman_test_queue").await.unwrap(), b"second");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_expire_missing_key() {
        let broker = RedisBroker::connect("redis://localhost:6379").await.unwrap();
        let err = broker
            .expire("foreman_missing_key", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::KeyNotFound(_)));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_subscribe_receives_json() {
        let broker = RedisBroker::connect("redis://localhost:6379").await.unwrap();
        let mut rx = broker.subscribe("foreman_test_control").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        broker
            .publish("foreman_test_control", br#"{"command":"ping"}"#.to_vec())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.field("command"), Some("ping"));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_stop_dequeue_aborts_pending_pop() {
        let broker = RedisBroker::connect("redis://localhost:6379").await.unwrap();
        let pending = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue("foreman_empty_queue").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.stop_dequeue().await;
        assert!(matches!(pending.await.unwrap(), Err(BrokerError::Stopped)));
    }
}
