//! Result envelopes returned to the platform

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const INVOCATION_RESULT_CLASS: &str =
    "com.backendless.coderunner.commons.protocol.InvocationResult";

pub const EXCEPTION_WRAPPER_CLASS: &str = "com.backendless.commons.exception.ExceptionWrapper";

pub const EXECUTION_RESULT_CLASS: &str = "com.backendless.servercode.ExecutionResult";

/// Exception class reported when the failure does not name one
pub const DEFAULT_EXCEPTION_CLASS: &str = "java.lang.Exception";

fn invocation_result_class() -> String {
    INVOCATION_RESULT_CLASS.to_string()
}

fn exception_wrapper_class() -> String {
    EXCEPTION_WRAPPER_CLASS.to_string()
}

fn execution_result_class() -> String {
    EXECUTION_RESULT_CLASS.to_string()
}

fn default_exception_class() -> String {
    DEFAULT_EXCEPTION_CLASS.to_string()
}

fn no_http_status() -> i64 {
    -1
}

/// HTTP response details a handler may set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,

    #[serde(default)]
    pub headers: Map<String, JsonValue>,
}

/// Error reported back to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionWrapper {
    #[serde(rename = "___jsonclass", default = "exception_wrapper_class")]
    pub class: String,

    /// Platform error code, 0 when unknown
    #[serde(default)]
    pub code: i64,

    /// HTTP status, -1 when unknown
    #[serde(default = "no_http_status")]
    pub http_status_code: i64,

    #[serde(default = "default_exception_class")]
    pub exception_class: String,

    pub exception_message: String,
}

impl ExceptionWrapper {
    /// Wrap a message with default code, status and class
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            class: exception_wrapper_class(),
            code: 0,
            http_status_code: no_http_status(),
            exception_class: default_exception_class(),
            exception_message: message.into(),
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
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    #[serde(rename = "___jsonclass", default = "invocation_result_class")]
    pub class: String,

    pub request_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response_status_code: Option<i64>,

    #[serde(default)]
    pub http_response_headers: Map<String, JsonValue>,

    /// Encoded result arguments
    #[serde(default)]
    pub arguments: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionWrapper>,
}

impl InvocationResult {
    /// Successful invocation carrying encoded arguments
    pub fn success(request_id: impl Into<String>, context: &ResponseContext, arguments: Vec<u8>) -> Self {
        Self {
            class: invocation_result_class(),
            request_id: request_id.into(),
            http_response_status_code: context.status_code,
            http_response_headers: context.headers.clone(),
            arguments,
            exception: None,
        }
    }

    /// Failed invocation
    pub fn failure(
        request_id: impl Into<String>,
        context: &ResponseContext,
        exception: ExceptionWrapper,
    ) -> Self {
        Self {
            exception: Some(exception),
            ..Self::success(request_id, context, Vec::new())
        }
    }

    /// Serialize to the JSON string published to the broker
    pub fn to_json_string(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Prior result handed to "after" handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(rename = "___jsonclass", default = "execution_result_class")]
    pub class: String,

    #[serde(default)]
    pub result: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionWrapper>,
}

impl ExecutionResult {
    pub fn new(result: Option<JsonValue>, exception: Option<ExceptionWrapper>) -> Self {
        Self {
            class: execution_result_class(),
            result,
            exception,
        }
    }
}
