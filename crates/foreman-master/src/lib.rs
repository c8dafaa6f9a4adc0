//! Foreman Master - worker pool and task scheduling
//!
//! This crate provides the master process of Foreman:
//! - the worker pool (subprocess lifecycle, caching, heartbeats, timeouts)
//! - the scheduler pulling tasks from the broker channels
//! - the management HTTP server

pub mod error;
pub mod management;
pub mod pool;
pub mod process;
pub mod scheduler;
pub mod shutdown;

pub use error::{PoolError, PoolResult, SchedulerError};
pub use management::ManagementServer;
pub use pool::{
    KillReason, Membership, PoolConfig, PoolHealth, PoolNotice, PoolStats, SlotReservation,
    WorkerId, WorkerInfo, WorkerPool,
};
pub use process::{ProcessLauncher, WorkerEvent, WorkerHandle, WorkerLauncher};
pub use scheduler::{Channel, Scheduler, SchedulerConfig, SessionKey};
