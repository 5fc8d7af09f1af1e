mod base_url;
mod error;
mod openai;
mod retry;

pub use base_url::{chat_completions_url, normalize_base_url, resolve_base_url};
pub use error::AdapterError;
pub use openai::{create_language_model, OpenAiCompatibleClient, Provider};
pub use retry::{call_with_retry, RetryConfig};

pub use novel_core::config::LlmConfig;
pub use novel_core::{LanguageModel, LanguageModelError};
