//! Foreman Broker - transports the master pulls tasks from and publishes results to
//!
//! This crate provides:
//! - the [`Broker`] transport trait
//! - Redis (blocking list pops, pub/sub)
//! - an in-memory transport for local runs and tests
//! - [`BrokerClient`], the task/result codec on top of a transport

pub mod client;
pub mod memory;
pub mod redis;
pub mod traits;

pub use client::BrokerClient;
pub use memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerConfig};
pub use traits::{Broker, BrokerError, BrokerEvent, BrokerResult, ControlMessage};
