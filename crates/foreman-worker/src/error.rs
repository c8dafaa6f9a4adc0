//! Worker error types

use foreman_core::result::DEFAULT_EXCEPTION_CLASS;
use foreman_core::ExceptionWrapper;
use thiserror::Error;

/// Message reported when the execution race is lost to the timer
pub const TIMEOUT_MESSAGE: &str = "Task execution is aborted due to timeout";

/// Failure of a single task, reported back to the platform as an exception
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,

    /// Platform error code, 0 when unknown
    pub code: i64,

    /// HTTP status, -1 when unknown
    pub http_status_code: i64,

    pub exception_class: String,

    timed_out: bool,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: 0,
            http_status_code: -1,
            exception_class: DEFAULT_EXCEPTION_CLASS.to_string(),
            timed_out: false,
        }
    }

    /// The execution did not finish before the task's timeout
    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::new(TIMEOUT_MESSAGE)
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_http_status(mut self, status: i64) -> Self {
        self.http_status_code = status;
        self
    }

    pub fn with_exception_class(mut self, class: impl Into<String>) -> Self {
        self.exception_class = class.into();
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    /// Wire form of this error
    pub fn to_exception(&self) -> ExceptionWrapper {
        ExceptionWrapper::new(self.message.clone())
            .with_code(self.code)
            .with_http_status(self.http_status_code)
            .with_exception_class(self.exception_class.clone())
    }
}

impl From<foreman_core::Error> for TaskError {
    fn from(err: foreman_core::Error) -> Self {
        TaskError::new(err.to_string())
    }
}

/// Errors that stop the worker runtime
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IPC error: {0}")]
    Ipc(#[from] foreman_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
