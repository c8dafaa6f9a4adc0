//! Business-logic code model: the lookup table of event handlers and services
//!
//! How code is discovered and turned into a model is up to the
//! [`ModelLoader`]. The worker binary ships a [`StaticModel`] whose handlers
//! and services are registered in code.

use async_trait::async_trait;
use foreman_core::json::{ObjectNode, Value};
use foreman_core::{ClassMappings, ObjectGraph, ResponseContext};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::TaskError;

/// Target that matches any handler target of an event
pub const ANY_TARGET: &str = "*";

/// Tenant API client state initialised from a task's `initAppData`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppClient {
    pub application_id: String,
    pub server_url: String,
    pub key: Option<String>,
}

/// Input of an event handler invocation
#[derive(Debug)]
pub struct HandlerRequest {
    pub task_id: String,
    pub application_id: String,
    pub event_id: i64,
    pub target: String,
    pub is_async: bool,

    /// Decoded arguments; item 0 is the invocation context
    pub args: ObjectGraph,

    /// HTTP status and headers the handler wants returned
    pub response: ResponseContext,

    pub client: Option<AppClient>,
}

impl HandlerRequest {
    /// The invocation context object
    pub fn context(&self) -> Option<&ObjectNode> {
        self.args
            .items()
            .first()
            .and_then(|value| self.args.object(value))
    }

    /// Event argument after the context
    pub fn argument(&self, index: usize) -> Option<&Value> {
        self.args.items().get(index + 1)
    }

    /// Event argument after the context, as plain JSON
    pub fn argument_json(&self, index: usize) -> Option<JsonValue> {
        let value = self.argument(index)?;
        self.args.value_to_json(value, &mut Default::default()).ok()
    }
}

/// Input of a service method invocation
#[derive(Debug)]
pub struct ServiceRequest {
    pub task_id: String,
    pub application_id: String,

    /// Invocation context (user, headers, configuration items)
    pub context: JsonValue,

    /// Decoded method arguments
    pub args: ObjectGraph,

    pub response: ResponseContext,

    pub client: Option<AppClient>,
}

/// An event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Run the handler; a returned value short-circuits the platform's own result
    async fn invoke(&self, request: &mut HandlerRequest) -> Result<Option<JsonValue>, TaskError>;
}

/// A custom API service
#[async_trait]
pub trait Service: Send + Sync {
    /// Invoke a method; `None` is reported as a null result
    async fn invoke_method(
        &self,
        method: &str,
        request: &mut ServiceRequest,
    ) -> Result<Option<JsonValue>, TaskError>;

    /// Service name used for lookup
    fn name(&self) -> &str;
}

/// Read-only view of the tenant's code
pub trait CodeModel: Send + Sync {
    fn handler(&self, event_id: i64, target: &str) -> Option<Arc<dyn EventHandler>>;

    /// Look up a service by its short class name
    fn service(&self, name: &str) -> Option<Arc<dyn Service>>;

    /// Factories for class-tagged arguments
    fn class_mappings(&self) -> &ClassMappings;

    /// Summary reported by the code analysis action
    fn describe(&self) -> JsonValue;
}

/// Builds the code model for a code path
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, code_path: &Path) -> Result<Arc<dyn CodeModel>, TaskError>;
}

/// Handlers and services registered in code
#[derive(Default)]
pub struct StaticModel {
    handlers: HashMap<(i64, String), Arc<dyn EventHandler>>,
    services: HashMap<String, Arc<dyn Service>>,
    mappings: ClassMappings,
}

impl StaticModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; use [`ANY_TARGET`] to match every target of the event
    pub fn register_handler(
        &mut self,
        event_id: i64,
        target: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.handlers.insert((event_id, target.into()), handler);
        self
    }

    /// Register a service under its own name
    pub fn register_service(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.services.insert(service.name().to_string(), service);
        self
    }

    /// Rehydrate objects tagged with `class_name` into `T`
    pub fn register_class<T>(&mut self, class_name: impl Into<String>) -> &mut Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.mappings.register::<T>(class_name);
        self
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

impl CodeModel for StaticModel {
    fn handler(&self, event_id: i64, target: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .get(&(event_id, target.to_string()))
            .or_else(|| self.handlers.get(&(event_id, ANY_TARGET.to_string())))
            .cloned()
    }

    fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).cloned()
    }

    fn class_mappings(&self) -> &ClassMappings {
        &self.mappings
    }

    fn describe(&self) -> JsonValue {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        let mut services: Vec<_> = self.services.keys().collect();
        services.sort();

        json!({
            "handlers": handlers
                .into_iter()
                .map(|(event_id, target)| json!({"eventId": event_id, "target": target}))
                .collect::<Vec<_>>(),
            "services": services,
        })
    }
}

/// Serves the same static model for every code path
pub struct StaticModelLoader {
    model: Arc<StaticModel>,
}

impl StaticModelLoader {
    pub fn new(model: StaticModel) -> Self {
        Self {
            model: Arc::new(model),
        }
    }
}

#[async_trait]
impl ModelLoader for StaticModelLoader {
    async fn load(&self, _code_path: &Path) -> Result<Arc<dyn CodeModel>, TaskError> {
        Ok(self.model.clone())
    }
}
