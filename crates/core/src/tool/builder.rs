use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::call::ToolContext;
use super::definition::{Parameters, ToolDefinition, ToolParameter};
use super::error::ToolError;
use super::Tool;

type SyncHandler = dyn Fn(&Parameters, &ToolContext) -> Result<Value, ToolError> + Send + Sync;
type AsyncHandler =
    dyn Fn(Parameters, ToolContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Sync(Arc<SyncHandler>),
    Async(Arc<AsyncHandler>),
}

/// A tool backed by a closure, produced by [`ToolBuilder`].
#[derive(Clone)]
pub struct FnTool {
    definition: ToolDefinition,
    handler: Handler,
}

#[async_trait]
impl Tool for FnTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        context: &ToolContext,
    ) -> Result<Value, ToolError> {
        match &self.handler {
            Handler::Sync(f) => f(parameters, context),
            Handler::Async(f) => f(parameters.clone(), context.clone()).await,
        }
    }
}

pub struct ToolBuilder {
    definition: ToolDefinition,
    handler: Option<Handler>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: ToolDefinition::new(name, ""),
            handler: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.definition.category = category.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.definition.version = version.into();
        self
    }

    pub fn parameter(mut self, parameter: ToolParameter) -> Self {
        self.definition.parameters.push(parameter);
        self
    }

    pub fn example(mut self, parameters: Parameters, result: Value) -> Self {
        self.definition = self.definition.example(parameters, result);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.definition.tags.push(tag.into());
        self
    }

    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parameters, &ToolContext) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.handler = Some(Handler::Sync(Arc::new(f)));
        self
    }

    pub fn async_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Parameters, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Some(Handler::Async(Arc::new(move |params, ctx| {
            f(params, ctx).boxed()
        })));
        self
    }

    pub fn build(self) -> Result<FnTool, ToolError> {
        if self.definition.name.trim().is_empty() {
            return Err(ToolError::InvalidDefinition(
                "tool name must not be empty".to_string(),
            ));
        }
        let handler = self.handler.ok_or_else(|| {
            ToolError::InvalidDefinition(format!(
                "tool `{}` has no handler",
                self.definition.name
            ))
        })?;
        Ok(FnTool {
            definition: self.definition,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{safe_execute, ParameterType};
    use serde_json::json;

    #[test]
    fn build_requires_name_and_handler() {
        assert!(matches!(
            ToolBuilder::new("  ").handler(|_, _| Ok(Value::Null)).build(),
            Err(ToolError::InvalidDefinition(_))
        ));
        assert!(matches!(
            ToolBuilder::new("noop").build(),
            Err(ToolError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn async_handler_receives_context() {
        let tool = ToolBuilder::new("greet")
            .description("问候")
            .category("demo")
            .tag("hello")
            .parameter(ToolParameter::new("name", ParameterType::String, "名字"))
            .async_handler(|params, ctx| async move {
                let who = params["name"].as_str().unwrap_or_default().to_string();
                let from = ctx
                    .get("sender")
                    .and_then(Value::as_str)
                    .unwrap_or("系统")
                    .to_string();
                Ok(json!(format!("{from} 向 {who} 问好")))
            })
            .build()
            .unwrap();

        assert_eq!(tool.definition().category, "demo");
        let mut ctx = ToolContext::new();
        ctx.insert("sender".into(), json!("作者"));
        let params = json!({"name": "林枫"}).as_object().cloned().unwrap();
        let response = safe_execute(&tool, "id", &params, &ctx).await;
        assert_eq!(response.result, json!("作者 向 林枫 问好"));
    }
}
