//! Tool framework: declarative definitions, the async `Tool` capability,
//! uniform call/response records and the registry that dispatches them.

mod builder;
mod call;
mod definition;
mod error;
mod hooks;
mod registry;
mod wrappers;

use async_trait::async_trait;
use futures::FutureExt;
use log::error;
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

pub use builder::{FnTool, ToolBuilder};
pub use call::{ToolCall, ToolContext, ToolResponse};
pub use definition::{ParameterType, Parameters, ToolDefinition, ToolExample, ToolParameter};
pub use error::ToolError;
pub use hooks::{ExecutionEvent, Hook, HookError, HookKind, HookResult};
pub use registry::{RegistryStats, ToolExecutionStats, ToolRegistry};
pub use wrappers::{CachedTool, RateLimitedTool, RetryTool};

pub(crate) use call::duration_secs;

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    fn name(&self) -> &str {
        &self.definition().name
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.definition().validate_parameters(parameters)
    }

    /// Runs the tool body. `parameters` already carries declared defaults.
    async fn execute(
        &self,
        parameters: &Parameters,
        context: &ToolContext,
    ) -> Result<Value, ToolError>;

    fn post_execute(&self, result: Value) -> Value {
        result
    }

    /// Called with the failure of an execution. A returned value becomes the
    /// `result` of the failure response.
    fn on_error(&self, err: &ToolError) -> Option<Value> {
        error!("工具 {} 执行失败: {}", self.name(), err);
        None
    }
}

/// Runs `validate → apply_defaults → execute → post_execute` and folds every
/// outcome, panics included, into one `ToolResponse`.
pub async fn safe_execute(
    tool: &dyn Tool,
    call_id: &str,
    parameters: &Parameters,
    context: &ToolContext,
) -> ToolResponse {
    let started = Instant::now();
    let name = tool.name().to_string();

    let outcome = AssertUnwindSafe(run_checked(tool, parameters, context))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ToolError::Panicked(panic_message(payload.as_ref()))));

    match outcome {
        Ok(value) => ToolResponse::success(call_id, &name, value, started.elapsed()),
        Err(err) => {
            let fallback = panic::catch_unwind(AssertUnwindSafe(|| tool.on_error(&err)))
                .unwrap_or_else(|payload| {
                    error!(
                        "工具 {} 的错误处理器发生 panic: {}",
                        name,
                        panic_message(payload.as_ref())
                    );
                    None
                });
            ToolResponse::failure(call_id, &name, err.to_string(), started.elapsed())
                .with_result(fallback.unwrap_or(Value::Null))
        }
    }
}

async fn run_checked(
    tool: &dyn Tool,
    parameters: &Parameters,
    context: &ToolContext,
) -> Result<Value, ToolError> {
    tool.validate(parameters)?;
    let prepared = tool.definition().apply_defaults(parameters);
    let value = tool.execute(&prepared, context).await?;
    Ok(tool.post_execute(value))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
