//! Worker-side task dispatch
//!
//! One task at a time: resolve the tenant's working directory, enrich the
//! task, initialise tenant client state, apply the sandbox, load the code
//! model, route by kind and race the execution against the task timeout.
//! Every failure ends up in the result envelope; nothing here stops the
//! worker.

use foreman_core::{InvocationResult, ResponseContext, Task, TaskKind, TaskMode, WorkerRunOptions};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::executor::{self, Execution};
use crate::model::{AppClient, CodeModel, ModelLoader};
use crate::sandbox::Sandbox;

/// Field of the invocation context holding headers the response starts with
const RESPONSE_HEADERS_FIELD: &str = "httpResponseHeaders";

/// What the runtime reports after a task
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Task finished; result JSON if it produced one
    Processed(Option<String>),
    /// The worker was asked to exit
    Shutdown,
}

pub struct Dispatcher {
    options: WorkerRunOptions,
    loader: Arc<dyn ModelLoader>,
    sandbox: Arc<dyn Sandbox>,
    sandbox_applied: bool,
    working_dir: Option<PathBuf>,
    client: Option<AppClient>,
    models: HashMap<PathBuf, Arc<dyn CodeModel>>,
}

impl Dispatcher {
    pub fn new(options: WorkerRunOptions, loader: Arc<dyn ModelLoader>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            options,
            loader,
            sandbox,
            sandbox_applied: false,
            working_dir: None,
            client: None,
            models: HashMap::new(),
        }
    }

    /// Directory of the tenant this worker serves, once it has seen a task
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Tenant client state from the latest task that carried it
    pub fn client(&self) -> Option<&AppClient> {
        self.client.as_ref()
    }

    /// Run one task to an outcome
    pub async fn dispatch(&mut self, mut task: Task) -> Outcome {
        let mut response = self.enrich(&mut task);

        let execution = match self.prepare(&task).await {
            Ok(model) => {
                let run = self.execute(&task, model, &mut response);
                match task.execution_timeout() {
                    Some(timeout) => tokio::time::timeout(timeout, run)
                        .await
                        .unwrap_or_else(|_| Err(TaskError::timeout())),
                    None => run.await,
                }
            }
            Err(e) => Err(e),
        };

        let result = match execution {
            Ok(Execution::Shutdown) => return Outcome::Shutdown,
            Ok(Execution::NoResult) => return Outcome::Processed(None),
            Ok(Execution::Arguments(arguments)) => {
                InvocationResult::success(task.id.as_str(), &response, arguments)
            }
            Err(e) => {
                if e.is_timeout() {
                    error!("[{}] {}", task.id, e);
                } else {
                    error!("[{}] Error: {}", task.id, e);
                }
                InvocationResult::failure(task.id.as_str(), &response, e.to_exception())
            }
        };

        match result.to_json_string() {
            Ok(json) => {
                debug!("[{}] response: {}", task.id, json);
                Outcome::Processed(Some(json))
            }
            Err(e) => {
                error!("[{}] Unable to serialize the invocation result: {}", task.id, e);
                Outcome::Processed(None)
            }
        }
    }

    /// Fill in the code path, normalise shutdown requests and build the response context
    fn enrich(&mut self, task: &mut Task) -> ResponseContext {
        let tenant_dir = self.options.repo_path.join(task.application_id.to_lowercase());

        if self.working_dir.is_none() {
            info!("Working directory: {}", tenant_dir.display());
            self.working_dir = Some(tenant_dir.clone());
        }

        let code_path = match &task.relative_path {
            Some(relative) => tenant_dir.join(relative),
            None => tenant_dir,
        };
        task.code_path = Some(code_path.to_string_lossy().into_owned());
        task.normalize();

        let headers = task
            .invocation_context
            .as_ref()
            .and_then(|context| context.get(RESPONSE_HEADERS_FIELD))
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_else(Map::new);

        ResponseContext {
            status_code: None,
            headers,
        }
    }

    /// Client state, sandbox and code model
    async fn prepare(&mut self, task: &Task) -> Result<Option<Arc<dyn CodeModel>>, TaskError> {
        if let Some(init) = &task.init_app_data {
            if init.key().is_none() {
                warn!("[{}] initAppData carries no key", task.id);
            }
            self.client = Some(AppClient {
                application_id: task.application_id.clone(),
                server_url: init.url.clone(),
                key: init.key().map(str::to_string),
            });
        }

        let sandbox_required = self.options.sandbox && task.mode != Some(TaskMode::Marketplace);
        if sandbox_required && !self.sandbox_applied {
            self.sandbox.apply(&task.application_id)?;
            self.sandbox_applied = true;
        }

        if task.kind == TaskKind::Action {
            return Ok(None);
        }

        let code_path = PathBuf::from(task.code_path.as_deref().unwrap_or_default());
        if let Some(model) = self.models.get(&code_path) {
            return Ok(Some(model.clone()));
        }

        let model = self.loader.load(&code_path).await?;
        self.models.insert(code_path, model.clone());
        Ok(Some(model))
    }

    async fn execute(
        &self,
        task: &Task,
        model: Option<Arc<dyn CodeModel>>,
        response: &mut ResponseContext,
    ) -> Result<Execution, TaskError> {
        let model = || model.clone().ok_or_else(|| TaskError::new("Code model is not available"));

        match task.kind {
            TaskKind::Handler => {
                executor::invoke_handler(task, model()?.as_ref(), response, self.client.clone()).await
            }
            TaskKind::Service => {
                executor::invoke_service(task, model()?.as_ref(), response, self.client.clone()).await
            }
            TaskKind::Action => executor::invoke_action(task, self.loader.as_ref()).await,
        }
    }
}
