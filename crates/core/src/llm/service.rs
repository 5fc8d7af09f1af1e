use log::debug;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use super::{
    ChatMessage, Completion, CompletionRequest, ConversationManager, LanguageModel,
    LanguageModelError,
};
use crate::prompts::{PromptArguments, PromptError, PromptTemplate};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to render prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("language model call failed: {0}")]
    Model(#[from] LanguageModelError),
}

#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub session_id: Option<String>,
    pub system_prompt: Option<String>,
    pub use_history: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            system_prompt: None,
            use_history: true,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn without_history(mut self) -> Self {
        self.use_history = false;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Wraps a [`LanguageModel`] with system prompts and per-session history.
pub struct LlmService {
    model: Arc<dyn LanguageModel>,
    conversations: ConversationManager,
}

impl LlmService {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            conversations: ConversationManager::default(),
        }
    }

    pub fn with_conversations(mut self, conversations: ConversationManager) -> Self {
        self.conversations = conversations;
        self
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    /// Sends `[system] + [history] + user` and, for sessions, records the exchange.
    pub async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Completion, LanguageModelError> {
        let mut messages = Vec::new();
        if let Some(system) = options.system_prompt.as_deref() {
            if !system.trim().is_empty() {
                messages.push(ChatMessage::system(system));
            }
        }
        if let (true, Some(session)) = (options.use_history, options.session_id.as_deref()) {
            messages.extend(self.conversations.history(session));
        }
        let user_message = ChatMessage::user(prompt);
        messages.push(user_message.clone());

        let request = CompletionRequest {
            messages,
            model: None,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let started = Instant::now();
        let mut completion = self.model.complete(request).await?;
        if completion.elapsed.is_zero() {
            completion.elapsed = started.elapsed();
        }
        debug!(
            "LLM 调用完成，耗时 {:.2}s，返回 {} 字符",
            completion.elapsed.as_secs_f64(),
            completion.content.chars().count()
        );

        if let Some(session) = options.session_id.as_deref() {
            self.conversations.add_message(session, user_message);
            self.conversations
                .add_message(session, ChatMessage::assistant(completion.content.clone()));
        }

        Ok(completion)
    }

    pub async fn generate_with_template(
        &self,
        template: &PromptTemplate,
        arguments: &PromptArguments,
        options: &GenerateOptions,
    ) -> Result<Completion, GenerationError> {
        let prompt = template.render(arguments)?;
        Ok(self.generate_text(&prompt, options).await?)
    }
}
