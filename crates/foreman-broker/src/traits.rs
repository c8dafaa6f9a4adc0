//! Broker trait definitions

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur during broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("publish error: {0}")]
    Publish(String),

    /// Dequeue error
    #[error("dequeue error: {0}")]
    Dequeue(String),

    /// `expire` was called on a key the server does not hold
    #[error("{0} doesn't exist on server")]
    KeyNotFound(String),

    /// Received task could not be decoded
    #[error("unable to parse received task: {0}")]
    Serialization(String),

    /// The operation's side of the broker has been stopped
    #[error("broker stopped")]
    Stopped,

    /// Pool error
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Whether the error means the connection itself is gone
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Pool(_))
    }
}

impl From<foreman_core::Error> for BrokerError {
    fn from(err: foreman_core::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Connectivity changes observed by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    Disconnected,
    Reconnected,
}

/// A message received on a pub/sub channel
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Payload that parsed as JSON
    Json(serde_json::Value),
    /// Payload delivered verbatim
    Raw(String),
}

impl ControlMessage {
    /// Parse a payload as JSON, falling back to the raw string
    pub fn parse(payload: &str) -> Self {
        match serde_json::from_str(payload) {
            Ok(value) => ControlMessage::Json(value),
            Err(_) => ControlMessage::Raw(payload.to_string()),
        }
    }

    /// String field of a JSON object message
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            ControlMessage::Json(value) => value.get(name).and_then(|v| v.as_str()),
            ControlMessage::Raw(_) => None,
        }
    }
}

/// Reconnection delay for the given attempt (1-based)
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis((u64::from(attempt) * 500).min(5000))
}

/// Transport the master talks to
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short transport name for logs
    fn name(&self) -> &'static str;

    /// Block until a payload is available on `channel`
    ///
    /// Calls on different channels never wait on each other.
    async fn dequeue(&self, channel: &str) -> BrokerResult<Vec<u8>>;

    /// Like [`Broker::dequeue`], but gives up after `wait` with `None`
    async fn poll(&self, channel: &str, wait: Duration) -> BrokerResult<Option<Vec<u8>>>;

    /// Publish a payload on `channel`
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BrokerResult<()>;

    /// Reset the TTL of `key`; fails with [`BrokerError::KeyNotFound`] if it does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> BrokerResult<()>;

    /// Receive every message published on `channel` from now on, in arrival order
    async fn subscribe(&self, channel: &str) -> BrokerResult<mpsc::UnboundedReceiver<ControlMessage>>;

    /// Connectivity events
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Abort pending dequeues and refuse new ones
    async fn stop_dequeue(&self);

    /// Refuse further publishes; implies [`Broker::stop_dequeue`]
    async fn stop_publish(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(4), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(10), Duration::from_secs(5));
        assert_eq!(reconnect_delay(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_control_message_parsing() {
        let msg = ControlMessage::parse(r#"{"command":"cleanup_code_all","applicationId":"A"}"#);
        assert_eq!(msg.field("command"), Some("cleanup_code_all"));
        assert_eq!(msg.field("applicationId"), Some("A"));

        let raw = ControlMessage::parse("not json");
        assert_eq!(raw, ControlMessage::Raw("not json".to_string()));
        assert_eq!(raw.field("command"), None);
    }

    #[test]
    fn test_key_not_found_message() {
        let err = BrokerError::KeyNotFound("session".to_string());
        assert_eq!(err.to_string(), "session doesn't exist on server");
    }
}
