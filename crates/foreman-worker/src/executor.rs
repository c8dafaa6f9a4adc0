//! Task executors: event handlers, service methods and administrative actions

use async_trait::async_trait;
use foreman_core::json::Value;
use foreman_core::task::{short_class_name, ANALYSE_CODE_ACTION, SHUTDOWN_ACTION};
use foreman_core::{args, ResponseContext, Task};
use serde_json::{json, Value as JsonValue};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::TaskError;
use crate::model::{AppClient, CodeModel, HandlerRequest, ModelLoader, Service, ServiceRequest};

/// Field of the invocation context that carries a handler's own result
pub const PREMATURE_RESULT_FIELD: &str = "prematureResult";

/// What an executor produced
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// Nothing to report (async handlers)
    NoResult,
    /// Encoded result arguments
    Arguments(Vec<u8>),
    /// The worker was asked to exit
    Shutdown,
}

/// Run an event handler
pub async fn invoke_handler(
    task: &Task,
    model: &dyn CodeModel,
    response: &mut ResponseContext,
    client: Option<AppClient>,
) -> Result<Execution, TaskError> {
    let event_id = task
        .event_id
        .ok_or_else(|| TaskError::new("Integrity violation. Handler task has no event id"))?;
    let target = task.target.clone().unwrap_or_default();

    if task.is_async {
        info!("[{}] [INVOKE HANDLER] {}({}, async)", task.id, event_id, target);
    } else {
        info!("[{}] [INVOKE HANDLER] {}({})", task.id, event_id, target);
    }

    let handler = model.handler(event_id, &target).ok_or_else(|| {
        TaskError::new(format!("{}({}) event handler does not exist", event_id, target))
    })?;

    let mut request = HandlerRequest {
        task_id: task.id.to_string(),
        application_id: task.application_id.clone(),
        event_id,
        target,
        is_async: task.is_async,
        args: args::decode(&task.arguments, model.class_mappings())?,
        response: std::mem::take(response),
        client,
    };

    let outcome = handler.invoke(&mut request).await;
    *response = std::mem::take(&mut request.response);
    let result = outcome?;

    if task.is_async {
        return Ok(Execution::NoResult);
    }

    if let Some(result) = result {
        let mut graph = request.args;
        let value = graph.insert_json(result);
        let context = graph.items().first().cloned();
        if let Some(object) = context.and_then(|context| graph.object_mut(&context)) {
            object.set(PREMATURE_RESULT_FIELD, value);
        }
        return Ok(Execution::Arguments(args::encode(&graph)?));
    }

    Ok(Execution::Arguments(args::encode(&request.args)?))
}

/// Run a service method
pub async fn invoke_service(
    task: &Task,
    model: &dyn CodeModel,
    response: &mut ResponseContext,
    client: Option<AppClient>,
) -> Result<Execution, TaskError> {
    let class_name = task.class_name.as_deref().unwrap_or_default();
    let method = task.method.as_deref().unwrap_or_default();
    info!("[{}] [INVOKE SERVICE] {}.{}", task.id, class_name, method);

    let service_name = short_class_name(class_name);
    let service = model
        .service(service_name)
        .ok_or_else(|| TaskError::new(format!("[{}] service does not exist", service_name)))?;

    let mut request = ServiceRequest {
        task_id: task.id.to_string(),
        application_id: task.application_id.clone(),
        context: task.invocation_context.clone().unwrap_or_else(|| json!({})),
        args: args::decode(&task.arguments, model.class_mappings())?,
        response: std::mem::take(response),
        client,
    };

    let outcome = service.invoke_method(method, &mut request).await;
    *response = request.response;
    let result = outcome?.unwrap_or(JsonValue::Null);

    Ok(Execution::Arguments(args::encode_json(result)?))
}

/// Run an administrative action
pub async fn invoke_action(task: &Task, loader: &dyn ModelLoader) -> Result<Execution, TaskError> {
    match task.action_type.as_deref() {
        Some(ANALYSE_CODE_ACTION) => {
            let code_path = task.code_path.as_deref().unwrap_or_default();
            info!("[ANALYSE CODE] codePath: {}", code_path);

            let model = loader.load(Path::new(code_path)).await?;
            Ok(Execution::Arguments(args::encode_json(model.describe())?))
        }
        Some(SHUTDOWN_ACTION) => {
            info!("Received a shutdown request");
            Ok(Execution::Shutdown)
        }
        other => Err(TaskError::new(format!(
            "Unknown action type: [{}]",
            other.unwrap_or_default()
        ))),
    }
}

/// Returns its arguments
pub struct EchoService;

#[async_trait]
impl Service for EchoService {
    async fn invoke_method(
        &self,
        method: &str,
        request: &mut ServiceRequest,
    ) -> Result<Option<JsonValue>, TaskError> {
        let args = request.args.to_json()?;

        Ok(Some(json!({
            "taskId": request.task_id,
            "method": method,
            "args": args,
        })))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Sleeps for the number of milliseconds given as the first argument
pub struct SleepService;

#[async_trait]
impl Service for SleepService {
    async fn invoke_method(
        &self,
        _method: &str,
        request: &mut ServiceRequest,
    ) -> Result<Option<JsonValue>, TaskError> {
        let millis = match request.args.items().first() {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(1000),
            _ => 1000,
        };

        tokio::time::sleep(Duration::from_millis(millis)).await;

        Ok(Some(json!({ "sleptFor": millis })))
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// Fails with the first argument as message
pub struct FailService;

#[async_trait]
impl Service for FailService {
    async fn invoke_method(
        &self,
        _method: &str,
        request: &mut ServiceRequest,
    ) -> Result<Option<JsonValue>, TaskError> {
        let message = request
            .args
            .items()
            .first()
            .and_then(Value::as_str)
            .unwrap_or("Intentional failure")
            .to_string();

        Err(TaskError::new(message).with_http_status(400))
    }

    fn name(&self) -> &str {
        "fail"
    }
}
