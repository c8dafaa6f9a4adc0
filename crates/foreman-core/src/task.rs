//! Task definitions as they arrive from the broker

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Wire discriminant of a handler (event) invocation
pub const HANDLER_INVOCATION_CLASS: &str =
    "com.backendless.coderunner.commons.protocol.RequestMethodInvocation";

/// Wire discriminant of an administrative action
pub const ACTION_INVOCATION_CLASS: &str =
    "com.backendless.coderunner.commons.protocol.RequestActionInvocation";

/// Wire discriminant of a service method invocation
pub const SERVICE_INVOCATION_CLASS: &str =
    "com.backendless.coderunner.commons.protocol.RequestServiceInvocation";

/// Event id the control plane uses to ask a worker to shut down
pub const SHUTDOWN_EVENT_ID: i64 = 32768;

/// Action type for the shutdown request
pub const SHUTDOWN_ACTION: &str = "SHUTDOWN";

/// Action type asking the worker to describe the tenant's code
pub const ANALYSE_CODE_ACTION: &str = "ANALYSE_SERVER_CODE";

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a task ID from an existing string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a task asks the worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Invoke an event handler (or timer)
    #[serde(rename = "com.backendless.coderunner.commons.protocol.RequestMethodInvocation")]
    Handler,
    /// Invoke a method of a hosted service
    #[serde(rename = "com.backendless.coderunner.commons.protocol.RequestServiceInvocation")]
    Service,
    /// Administrative action (code analysis, shutdown)
    #[serde(rename = "com.backendless.coderunner.commons.protocol.RequestActionInvocation")]
    Action,
}

impl TaskKind {
    /// Whether a worker that ran this kind of task may be reused for the same tenant
    pub fn is_cacheable(&self) -> bool {
        matches!(self, TaskKind::Handler | TaskKind::Service)
    }

    /// Wire discriminant
    pub fn class_name(&self) -> &'static str {
        match self {
            TaskKind::Handler => HANDLER_INVOCATION_CLASS,
            TaskKind::Service => SERVICE_INVOCATION_CLASS,
            TaskKind::Action => ACTION_INVOCATION_CLASS,
        }
    }

    /// Parse a wire discriminant
    pub fn from_class_name(class_name: &str) -> crate::Result<Self> {
        match class_name {
            HANDLER_INVOCATION_CLASS => Ok(TaskKind::Handler),
            SERVICE_INVOCATION_CLASS => Ok(TaskKind::Service),
            ACTION_INVOCATION_CLASS => Ok(TaskKind::Action),
            other => Err(crate::Error::UnknownTaskKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Handler => write!(f, "handler"),
            TaskKind::Service => write!(f, "service"),
            TaskKind::Action => write!(f, "action"),
        }
    }
}

/// Deployment mode of the code a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMode {
    #[default]
    Production,
    Marketplace,
    Debug,
}

/// Data the worker needs to initialise the tenant's API client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitAppData {
    /// API server URL
    pub url: String,

    /// API key (preferred over the secret key when both are present)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Secret key
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl InitAppData {
    /// The key used to initialise the client
    pub fn key(&self) -> Option<&str> {
        self.api_key.as_deref().or(self.secret_key.as_deref())
    }
}

fn unbounded_timeout() -> i64 {
    -1
}

/// A unit of work pulled from the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task ID
    pub id: TaskId,

    /// Kind discriminant
    #[serde(rename = "___jsonclass")]
    pub kind: TaskKind,

    /// Tenant the task belongs to
    pub application_id: String,

    /// Code path relative to the tenant directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,

    /// Absolute code path, filled in by the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_path: Option<String>,

    /// File that provides the handler or service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Encoded argument list (UTF-8 bytes of the argument JSON)
    #[serde(default)]
    pub arguments: Vec<u8>,

    /// Timeout in milliseconds; negative means unbounded
    #[serde(default = "unbounded_timeout")]
    pub timeout: i64,

    /// Whether the worker may be kept warm for the same tenant afterwards
    #[serde(default)]
    pub cacheable: bool,

    /// Channel the result is published to
    #[serde(default)]
    pub response_channel_id: String,

    /// Handler event id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,

    /// Handler target (table, timer name, custom event name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Async handlers produce no result
    #[serde(default, rename = "async")]
    pub is_async: bool,

    /// Fully qualified service class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Service method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Administrative action type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,

    /// Administrative action argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_object: Option<serde_json::Value>,

    /// Deployment model name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_model_name: Option<String>,

    /// Tenant client initialisation data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_app_data: Option<InitAppData>,

    /// Invocation context (user, headers, ...); opaque to the engine
    #[serde(default, rename = "invocationContextDto", skip_serializing_if = "Option::is_none")]
    pub invocation_context: Option<serde_json::Value>,

    /// Deployment mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TaskMode>,
}

impl Task {
    fn with_kind(kind: TaskKind, application_id: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            application_id: application_id.into(),
            relative_path: None,
            code_path: None,
            provider: None,
            arguments: Vec::new(),
            timeout: unbounded_timeout(),
            cacheable: false,
            response_channel_id: String::new(),
            event_id: None,
            target: None,
            is_async: false,
            class_name: None,
            method: None,
            action_type: None,
            arg_object: None,
            deployment_model_name: None,
            init_app_data: None,
            invocation_context: None,
            mode: None,
        }
    }

    /// Create a handler invocation task
    pub fn handler(application_id: impl Into<String>, event_id: i64, target: impl Into<String>) -> Self {
        let mut task = Self::with_kind(TaskKind::Handler, application_id);
        task.event_id = Some(event_id);
        task.target = Some(target.into());
        task
    }

    /// Create a service invocation task
    pub fn service(
        application_id: impl Into<String>,
        class_name: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        let mut task = Self::with_kind(TaskKind::Service, application_id);
        task.class_name = Some(class_name.into());
        task.method = Some(method.into());
        task
    }

    /// Create an administrative action task
    pub fn action(application_id: impl Into<String>, action_type: impl Into<String>) -> Self {
        let mut task = Self::with_kind(TaskKind::Action, application_id);
        task.action_type = Some(action_type.into());
        task
    }

    /// Set the task ID
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the timeout in milliseconds (negative = unbounded)
    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    /// Set the encoded arguments
    pub fn with_arguments(mut self, arguments: Vec<u8>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Set the response channel
    pub fn with_response_channel(mut self, channel: impl Into<String>) -> Self {
        self.response_channel_id = channel.into();
        self
    }

    /// Set the provider file
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Mark a handler invocation as async
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Decide cacheability from the task kind and whether the pool caches workers
    pub fn prepare(&mut self, cache_enabled: bool) {
        self.cacheable = cache_enabled && self.kind.is_cacheable();
    }

    /// Rewrite the shutdown handler event into a shutdown action
    pub fn normalize(&mut self) {
        if self.kind == TaskKind::Handler && self.event_id == Some(SHUTDOWN_EVENT_ID) {
            self.kind = TaskKind::Action;
            self.action_type = Some(SHUTDOWN_ACTION.to_string());
        }
    }

    /// Timeout the worker races execution against, if bounded
    pub fn execution_timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout).ok().map(Duration::from_millis)
    }

    /// Timeout the master enforces by killing the worker; zero or negative disables it
    pub fn enforced_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout as u64))
    }

    /// Short description used in log lines and kill reasons
    pub fn details(&self) -> String {
        let mut details = vec![format!("appId: {}", self.application_id)];

        if let Some(model) = &self.deployment_model_name {
            details.push(format!("model: {}", model));
        }
        if let Some(class_name) = &self.class_name {
            details.push(format!("service: {}", short_class_name(class_name)));
        }
        if let Some(method) = &self.method {
            details.push(format!("method: {}", method));
        }
        if let Some(event_id) = self.event_id {
            details.push(format!(
                "handler: {}({})",
                event_id,
                self.target.as_deref().unwrap_or_default()
            ));
        }
        if let Some(action) = &self.action_type {
            details.push(format!("action: {}", action));
        }
        if let Some(provider) = &self.provider {
            details.push(format!("file-path: {}", provider));
        }

        details.join(", ")
    }
}

/// Strip the namespace from a fully qualified class name
pub fn short_class_name(class_name: &str) -> &str {
    class_name.rsplit('.').next().unwrap_or(class_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generation() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_parse_wire_task() {
        let json = serde_json::json!({
            "id": "task-1",
            "___jsonclass": SERVICE_INVOCATION_CLASS,
            "applicationId": "APP-1",
            "className": "services.Greetings",
            "method": "hello",
            "arguments": [91, 93],
            "timeout": 5000,
            "responseChannelId": "resp-1",
            "invocationContextDto": {"userId": "u1"}
        });

        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.id.as_str(), "task-1");
        assert_eq!(task.kind, TaskKind::Service);
        assert_eq!(task.arguments, b"[]".to_vec());
        assert_eq!(task.response_channel_id, "resp-1");
        assert!(!task.cacheable);
        assert!(task.invocation_context.is_some());
    }

    #[test]
    fn test_missing_timeout_is_unbounded() {
        let json = serde_json::json!({
            "id": "t",
            "___jsonclass": ACTION_INVOCATION_CLASS,
            "applicationId": "app",
            "actionType": "ANALYSE_SERVER_CODE"
        });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.timeout, -1);
        assert_eq!(task.execution_timeout(), None);
        assert_eq!(task.enforced_timeout(), None);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = serde_json::json!({
            "id": "t",
            "___jsonclass": "com.example.Unknown",
            "applicationId": "app"
        });
        assert!(serde_json::from_value::<Task>(json).is_err());
        assert!(TaskKind::from_class_name("com.example.Unknown").is_err());
    }

    #[test]
    fn test_cacheability_follows_kind_and_pool() {
        let mut handler = Task::handler("app", 100, "Users");
        handler.prepare(true);
        assert!(handler.cacheable);

        let mut service = Task::service("app", "services.Cart", "add");
        service.prepare(false);
        assert!(!service.cacheable);

        let mut action = Task::action("app", ANALYSE_CODE_ACTION);
        action.prepare(true);
        assert!(!action.cacheable);
    }

    #[test]
    fn test_shutdown_event_normalized() {
        let mut task = Task::handler("app", SHUTDOWN_EVENT_ID, "");
        task.normalize();
        assert_eq!(task.kind, TaskKind::Action);
        assert_eq!(task.action_type.as_deref(), Some(SHUTDOWN_ACTION));
    }

    #[test]
    fn test_timeouts() {
        let task = Task::handler("app", 1, "t").with_timeout(0);
        assert_eq!(task.execution_timeout(), Some(Duration::ZERO));
        assert_eq!(task.enforced_timeout(), None);

        let task = task.with_timeout(250);
        assert_eq!(task.enforced_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_details() {
        let task = Task::service("APP", "services.ShoppingCart", "addItem").with_provider("cart.rs");
        assert_eq!(
            task.details(),
            "appId: APP, service: ShoppingCart, method: addItem, file-path: cart.rs"
        );
    }
}
