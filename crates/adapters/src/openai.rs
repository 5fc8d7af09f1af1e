use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use reqwest::header::{self, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use novel_core::config::LlmConfig;
use novel_core::{Completion, CompletionRequest, LanguageModel, LanguageModelError, TokenUsage};

use crate::base_url::{chat_completions_url, resolve_base_url};
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    DeepSeek,
    Ollama,
    LmStudio,
    Custom,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "deepseek" => Some(Self::DeepSeek),
            "ollama" => Some(Self::Ollama),
            "lmstudio" | "lm studio" | "ml studio" => Some(Self::LmStudio),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Custom endpoints have no default and must set `api_base`.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
            Self::LmStudio => "http://localhost:1234/v1",
            Self::Custom => "",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::OpenAi | Self::DeepSeek)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
            Self::Ollama => "ollama",
            Self::LmStudio => "lmstudio",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>, AdapterError> {
    Ok(Arc::new(OpenAiCompatibleClient::from_config(config)?))
}

pub struct OpenAiCompatibleClient {
    client: Client,
    provider: Provider,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    retry: RetryConfig,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, AdapterError> {
        let provider = Provider::parse(&config.provider).ok_or_else(|| {
            AdapterError::InvalidConfig(format!("unknown provider: {}", config.provider))
        })?;

        let base_url = resolve_base_url(&config.api_base, provider.default_base_url());
        if base_url.is_empty() {
            return Err(AdapterError::InvalidConfig(format!(
                "provider `{provider}` requires api_base"
            )));
        }
        if config.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let api_key = Some(config.api_key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        if api_key.is_none() && provider.requires_api_key() {
            return Err(AdapterError::InvalidConfig(format!(
                "provider `{provider}` requires api_key"
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()?;

        Ok(Self {
            client,
            provider,
            url: chat_completions_url(&base_url),
            api_key,
            model_name: config.model_name.clone(),
            max_tokens: (config.max_tokens > 0).then_some(config.max_tokens),
            temperature: config.temperature,
            retry: RetryConfig::from_llm_config(config),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_body<'a>(&'a self, request: &'a CompletionRequest) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: request.model.as_deref().unwrap_or(&self.model_name),
            messages: request
                .messages
                .iter()
                .map(|message| ChatMessageRequest {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            max_tokens: request.max_tokens.or(self.max_tokens),
            temperature: Some(request.temperature.unwrap_or(self.temperature)),
        }
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<Completion, AdapterError> {
        let body = self.build_body(request);
        let mut builder = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let started = Instant::now();
        let response = builder.json(&body).send().await?;
        let mut completion = handle_chat_response(response).await?;
        completion.elapsed = started.elapsed();
        if completion.model.is_empty() {
            completion.model = body.model.to_string();
        }
        Ok(completion)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LanguageModelError> {
        debug!("POST {} ({} messages)", self.url, request.messages.len());
        call_with_retry(|| self.complete_once(&request), &self.retry)
            .await
            .map_err(LanguageModelError::new)
    }
}

async fn handle_chat_response(response: reqwest::Response) -> Result<Completion, AdapterError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::HttpStatus { status, body });
    }

    let text = response.text().await?;
    let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
    into_completion(parsed).ok_or(AdapterError::EmptyResponse)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First choice with non-blank content wins; `text` covers legacy completion payloads.
fn into_completion(response: ChatCompletionResponse) -> Option<Completion> {
    let ChatCompletionResponse {
        model,
        choices,
        usage,
    } = response;

    choices.into_iter().find_map(|choice| {
        let content = choice
            .message
            .and_then(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .or_else(|| choice.text.filter(|text| !text.trim().is_empty()))?;
        Some(Completion {
            content,
            model: model.clone().unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage: usage.clone(),
            elapsed: Duration::ZERO,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use novel_core::ChatMessage;
    use serde_json::json;

    fn config(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            api_key: "sk-test".to_string(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn provider_table_supplies_base_urls() {
        let client = OpenAiCompatibleClient::from_config(&config("DeepSeek")).unwrap();
        assert_eq!(client.provider(), Provider::DeepSeek);
        assert_eq!(client.url(), "https://api.deepseek.com/v1/chat/completions");

        let local = LlmConfig {
            api_key: String::new(),
            ..config("lm studio")
        };
        let client = OpenAiCompatibleClient::from_config(&local).unwrap();
        assert_eq!(client.url(), "http://localhost:1234/v1/chat/completions");

        let custom = LlmConfig {
            api_base: "https://llm.internal.example/".to_string(),
            ..config("custom")
        };
        let client = OpenAiCompatibleClient::from_config(&custom).unwrap();
        assert_eq!(client.url(), "https://llm.internal.example/v1/chat/completions");
    }

    #[test]
    fn rejects_incomplete_configuration() {
        assert!(matches!(
            OpenAiCompatibleClient::from_config(&config("custom")),
            Err(AdapterError::InvalidConfig(_))
        ));
        assert!(matches!(
            OpenAiCompatibleClient::from_config(&config("gemini")),
            Err(AdapterError::InvalidConfig(_))
        ));
        let keyless = LlmConfig {
            api_key: "  ".to_string(),
            ..config("openai")
        };
        assert!(OpenAiCompatibleClient::from_config(&keyless).is_err());
        assert!(create_language_model(&LlmConfig {
            api_key: String::new(),
            ..config("ollama")
        })
        .is_ok());
    }

    #[test]
    fn request_body_prefers_per_call_overrides() {
        let client = OpenAiCompatibleClient::from_config(&config("openai")).unwrap();
        let mut request = CompletionRequest::new(vec![
            ChatMessage::system("你是一位小说家"),
            ChatMessage::user("写一个开头"),
        ]);
        let body = serde_json::to_value(client.build_body(&request)).unwrap();
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "写一个开头");

        request.model = Some("deepseek-chat".to_string());
        request.max_tokens = Some(128);
        request.temperature = Some(0.2);
        let body = serde_json::to_value(client.build_body(&request)).unwrap();
        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["max_tokens"], 128);
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn extracts_first_non_empty_choice() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "model": "gpt-4o-mini",
            "choices": [
                {"message": {"content": "  "}},
                {"message": {"content": "第一章"}, "finish_reason": "stop"}
            ],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();
        let completion = into_completion(response).unwrap();
        assert_eq!(completion.content, "第一章");
        assert_eq!(completion.model, "gpt-4o-mini");
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.map(|u| u.total_tokens), Some(15));

        let legacy: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": [{"text": "旧格式"}]})).unwrap();
        assert_eq!(into_completion(legacy).unwrap().content, "旧格式");

        let empty: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(into_completion(empty).is_none());
    }
}
