//! Master error types

use crate::pool::WorkerId;
use foreman_broker::BrokerError;
use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by the worker pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// No worker could be started within the retry budget
    #[error("unable to provision a worker: {0}")]
    Provisioning(String),

    /// The task could not be handed to the worker
    #[error("failed to dispatch task to worker {worker}: {reason}")]
    Dispatch { worker: WorkerId, reason: String },

    /// The pool no longer accepts tasks
    #[error("worker pool is draining")]
    Draining,

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
}

/// Errors that stop the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The session key expired; another master may own the queues now
    #[error("session lost: {0}")]
    SessionLost(BrokerError),
}
