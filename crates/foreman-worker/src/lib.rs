//! Foreman Worker - runs business logic inside a worker subprocess
//!
//! This crate provides the worker side of Foreman:
//! - the IPC runtime (handshake, heartbeats, one task at a time)
//! - the dispatcher (task enrichment, sandbox, code model, timeout race)
//! - handler, service and action executors
//! - the code model traits and a static registry

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod model;
pub mod runtime;
pub mod sandbox;

pub use dispatcher::{Dispatcher, Outcome};
pub use error::{TaskError, WorkerError, WorkerResult};
pub use executor::{EchoService, Execution, FailService, SleepService};
pub use model::{CodeModel, EventHandler, ModelLoader, Service, StaticModel, StaticModelLoader};
pub use runtime::WorkerRuntime;
pub use sandbox::{NoSandbox, Sandbox};
