//! Integration tests against a live Redis
//!
//! These tests require a running Redis instance.
//! Run with: cargo test -p foreman-tests -- --ignored

use foreman_broker::{Broker, BrokerClient, BrokerError, ControlMessage, RedisBroker};
use foreman_core::config::CompressionConfig;
use foreman_core::Task;
use foreman_tests::common::{init, unique_queue};
use std::sync::Arc;
use std::time::Duration;

const REDIS_URL: &str = "redis://localhost:6379";

async fn connect() -> RedisBroker {
    init();
    RedisBroker::connect(REDIS_URL)
        .await
        .expect("Failed to connect to Redis")
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(REDIS_URL)
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dequeue_pops_head_of_list() {
    let broker = connect().await;
    let queue = unique_queue("tasks");

    let mut conn = raw_connection().await;
    let _: i64 = redis::cmd("RPUSH")
        .arg(&queue)
        .arg(b"first".to_vec())
        .arg(b"second".to_vec())
        .query_async(&mut conn)
        .await
        .unwrap();

    assert_eq!(broker.dequeue(&queue).await.unwrap(), b"first".to_vec());
    assert_eq!(broker.dequeue(&queue).await.unwrap(), b"second".to_vec());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_poll_times_out_on_empty_list() {
    let broker = connect().await;
    let queue = unique_queue("low");

    let polled = broker.poll(&queue, Duration::from_millis(200)).await.unwrap();
    assert!(polled.is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_task_round_trip_through_redis() {
    let broker: Arc<dyn Broker> = Arc::new(connect().await);
    let client = BrokerClient::new(Arc::clone(&broker), CompressionConfig::default());
    let queue = unique_queue("tasks");

    let task = Task::service("TENANT", "echo", "ping").with_timeout(5000);
    let payload = client.encode_task(&task).unwrap();

    let mut conn = raw_connection().await;
    let _: i64 = redis::cmd("RPUSH")
        .arg(&queue)
        .arg(payload)
        .query_async(&mut conn)
        .await
        .unwrap();

    let received = client.next_task(&queue).await.unwrap();
    assert_eq!(received.id, task.id);
    assert_eq!(received.application_id, "TENANT");
    assert_eq!(received.timeout, 5000);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_subscriber_receives_control_messages() {
    let broker = connect().await;
    let channel = unique_queue("control");

    let mut messages = broker.subscribe(&channel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker
        .publish(
            &channel,
            br#"{"command":"cleanup_code_all","applicationId":"A"}"#.to_vec(),
        )
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.field("applicationId"), Some("A"));
    assert!(matches!(message, ControlMessage::Json(_)));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_expire_missing_key_is_reported() {
    let broker = connect().await;
    let key = unique_queue("session");

    let outcome = broker.expire(&key, Duration::from_secs(10)).await;
    assert!(matches!(outcome, Err(BrokerError::KeyNotFound(_))));

    let mut conn = raw_connection().await;
    let _: () = redis::cmd("SET")
        .arg(&key)
        .arg("master")
        .query_async(&mut conn)
        .await
        .unwrap();
    broker.expire(&key, Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stop_dequeue_releases_blocked_pop() {
    let broker = Arc::new(connect().await);
    let queue = unique_queue("idle");

    let waiting = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.dequeue(&queue).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    broker.stop_dequeue().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(BrokerError::Stopped)));
}
