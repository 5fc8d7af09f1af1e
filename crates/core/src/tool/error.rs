use thiserror::Error;

use super::hooks::HookKind;
use crate::llm::{GenerationError, LanguageModelError};
use crate::prompts::PromptError;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool `{0}` not found")]
    NotFound(String),
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("tool `{tool}` depends on unavailable tools: {}", .missing.join(", "))]
    MissingDependency { tool: String, missing: Vec<String> },
    #[error("invalid tool definition: {0}")]
    InvalidDefinition(String),
    #[error("{0}")]
    Execution(String),
    #[error("tool `{tool}` exceeded {limit} calls per minute")]
    RateLimited { tool: String, limit: u32 },
    #[error("language model call failed: {0}")]
    Model(#[from] LanguageModelError),
    #[error("failed to render prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("could not parse model output: {0}")]
    Parse(String),
    #[error("failed to serialize tool data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hook cannot be attached to `{kind}`")]
    HookMismatch { kind: HookKind },
    #[error("tool panicked: {0}")]
    Panicked(String),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::Execution(message.into())
    }

    /// Errors caused by the caller's input; re-running the same call cannot fix them.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ToolError::NotFound(_)
                | ToolError::MissingParameters(_)
                | ToolError::InvalidParameter { .. }
                | ToolError::InvalidDefinition(_)
                | ToolError::HookMismatch { .. }
        )
    }
}

impl From<GenerationError> for ToolError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Prompt(source) => ToolError::Prompt(source),
            GenerationError::Model(source) => ToolError::Model(source),
        }
    }
}
