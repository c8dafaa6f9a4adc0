//! Foreman Core - shared types for the Foreman job execution service
//!
//! This crate provides the pieces both the master and its workers rely on:
//! - Task definitions and normalisation
//! - Envelope compression and the object-graph JSON codec
//! - Result envelopes
//! - Worker IPC messages
//! - Configuration structures
//! - Error types

pub mod args;
pub mod compression;
pub mod config;
pub mod error;
pub mod json;
pub mod message;
pub mod result;
pub mod task;

pub use config::{ForemanConfig, WorkerRunOptions, WorkersConfig};
pub use error::{Error, Result};
pub use json::{ClassMappings, ObjectGraph};
pub use message::{MasterMessage, WorkerMessage, WorkerSignal};
pub use result::{ExceptionWrapper, ExecutionResult, InvocationResult, ResponseContext};
pub use task::{Task, TaskId, TaskKind, TaskMode};
