pub mod cache;
pub mod config;
pub mod llm;
pub mod logging;
pub mod novel;
pub mod parsing;
pub mod prompts;
pub mod tool;

pub use cache::{CacheManager, CacheStats};
pub use config::{
    AppSettings, CacheConfig, ConfigError, ConfigLoader, LlmConfig, NovelConfig, PromptConfig,
    ToolsConfig,
};
pub use llm::{
    ChatMessage, ChatRole, Completion, CompletionRequest, ConversationManager, GenerateOptions,
    GenerationError, LanguageModel, LanguageModelError, LlmService, TokenUsage,
};
pub use logging::{
    FileLogSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink,
    TeeLogSink, VecLogSink,
};
pub use novel::{
    register_novel_tools, GenerationRequest, Novel, NovelGenerator, NovelStore, PipelineError,
};
pub use prompts::{PromptArguments, PromptError, PromptLibrary, PromptSource, PromptTemplate};
pub use tool::{
    safe_execute, ParameterType, Parameters, Tool, ToolBuilder, ToolCall, ToolContext,
    ToolDefinition, ToolError, ToolParameter, ToolRegistry, ToolResponse,
};
