//! Novel domain: models, the four generation tools and their registration.

mod chapter;
mod character;
mod models;
mod pipeline;
mod plot;
mod storage;
mod world;

use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{self, CacheManager};
use crate::config::ToolsConfig;
use crate::llm::{GenerateOptions, LlmService};
use crate::parsing::{str_field, string_list};
use crate::prompts::{PromptArguments, PromptLibrary};
use crate::tool::{
    CachedTool, Parameters, RateLimitedTool, RetryTool, Tool, ToolError, ToolRegistry,
};

pub use chapter::{dialogue_ratio, style_description, ChapterWriterTool, WRITING_STYLES};
pub use character::CharacterCreatorTool;
pub use models::{
    Chapter, ChapterPlan, Character, Faction, HistoryEvent, Novel, NovelStatus, PlotPoint,
    StoryOutline, WorldSetting,
};
pub use pipeline::{GenerationRequest, NovelGenerator, PipelineError, PipelineStep};
pub use plot::{backfill_plan, tension_for, StoryPlannerTool};
pub use storage::{render_text, slugify, NovelStore, StorageError, NOVEL_JSON, NOVEL_TEXT};
pub use world::{default_world, WorldBuilderTool};

pub const WORLD_BUILDER: &str = "world_builder";
pub const CHARACTER_CREATOR: &str = "character_creator";
pub const STORY_PLANNER: &str = "story_planner";
pub const CHAPTER_WRITER: &str = "chapter_writer";

/// Prompt rendering plus a stateless model call, shared by the novel tools.
#[derive(Clone)]
pub struct NovelAssistant {
    service: Arc<LlmService>,
    prompts: Arc<PromptLibrary>,
}

impl NovelAssistant {
    pub fn new(service: Arc<LlmService>, prompts: Arc<PromptLibrary>) -> Self {
        Self { service, prompts }
    }

    pub fn service(&self) -> &Arc<LlmService> {
        &self.service
    }

    pub fn prompts(&self) -> &Arc<PromptLibrary> {
        &self.prompts
    }

    pub(crate) async fn ask<I, K, V>(
        &self,
        section: &str,
        name: &str,
        arguments: I,
    ) -> Result<String, ToolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let template = self.prompts.template(section, name)?;
        let arguments: PromptArguments = arguments
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut options = GenerateOptions::new().without_history();
        if let Some(system) = template.system() {
            options = options.system(system);
        }
        debug!("调用提示词 {}", template.key());
        let completion = self
            .service
            .generate_with_template(template, &arguments, &options)
            .await?;
        Ok(completion.content)
    }
}

pub(crate) fn text_param<'a>(parameters: &'a Parameters, key: &str, default: &'a str) -> &'a str {
    let value = str_field(parameters, key, default);
    if value.trim().is_empty() {
        default
    } else {
        value
    }
}

pub(crate) fn count_param(parameters: &Parameters, key: &str, default: u64) -> u64 {
    parameters
        .get(key)
        .and_then(|value| value.as_u64().or_else(|| value.as_f64().map(|f| f as u64)))
        .unwrap_or(default)
}

/// World context may arrive as a world-builder result, a bare world object or plain text.
pub(crate) fn world_summary(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(value) if value.is_object() => {
            let world = value.get("world").unwrap_or(value);
            WorldSetting::from_value(world).summary()
        }
        _ => "未指定".to_string(),
    }
}

/// Character context may be a character-creator result, a list of characters or names.
pub(crate) fn character_summaries(value: Option<&Value>) -> Vec<String> {
    let items = match value {
        Some(Value::Object(map)) => map.get("characters"),
        other => other,
    };
    match items {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(_) => serde_json::from_value::<Character>(item.clone())
                    .ok()
                    .map(|c| c.summary()),
                Value::String(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
                _ => None,
            })
            .collect(),
        other => string_list(other),
    }
}

/// Registers the novel tools with the process-wide cache.
pub fn register_novel_tools(
    registry: &ToolRegistry,
    service: Arc<LlmService>,
    prompts: Arc<PromptLibrary>,
    config: &ToolsConfig,
) -> Result<(), ToolError> {
    let cache = config.cache_results.then(cache::global);
    register_novel_tools_with_cache(registry, service, prompts, config, cache)
}

/// Registers world_builder, character_creator, story_planner and chapter_writer.
/// Every tool gets retries and, when configured, rate limiting; the planning
/// tools are also cached when `cache` is given.
pub fn register_novel_tools_with_cache(
    registry: &ToolRegistry,
    service: Arc<LlmService>,
    prompts: Arc<PromptLibrary>,
    config: &ToolsConfig,
    cache: Option<Arc<CacheManager>>,
) -> Result<(), ToolError> {
    let assistant = NovelAssistant::new(service, prompts);

    let tools: [(Arc<dyn Tool>, &[&str], bool); 4] = [
        (
            Arc::new(WorldBuilderTool::new(assistant.clone())),
            &["world", "build_world"],
            true,
        ),
        (
            Arc::new(CharacterCreatorTool::new(assistant.clone())),
            &["character", "create_character"],
            true,
        ),
        (
            Arc::new(StoryPlannerTool::new(assistant.clone())),
            &["plot", "outline"],
            true,
        ),
        (
            Arc::new(ChapterWriterTool::new(assistant)),
            &["chapter", "write_chapter"],
            false,
        ),
    ];

    let count = tools.len();
    for (tool, aliases, cacheable) in tools {
        let cache = if cacheable { cache.clone() } else { None };
        registry.register_shared(decorate(tool, config, cache), aliases)?;
    }
    registry.set_dependencies(CHAPTER_WRITER, [STORY_PLANNER]);

    info!("已注册 {count} 个小说生成工具");
    Ok(())
}

fn decorate(
    tool: Arc<dyn Tool>,
    config: &ToolsConfig,
    cache: Option<Arc<CacheManager>>,
) -> Arc<dyn Tool> {
    let mut tool: Arc<dyn Tool> = Arc::new(RetryTool::new(
        tool,
        config.retry_attempts,
        Duration::from_millis(config.retry_delay_ms),
    ));
    if config.rate_limit_per_minute > 0 {
        tool = Arc::new(RateLimitedTool::new(tool, config.rate_limit_per_minute));
    }
    if let Some(cache) = cache {
        tool = Arc::new(CachedTool::new(
            tool,
            cache,
            Duration::from_secs(config.cache_ttl_secs),
        ));
    }
    tool
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::NovelAssistant;
    use crate::llm::{Completion, CompletionRequest, LanguageModel, LanguageModelError, LlmService};
    use crate::prompts::PromptLibrary;

    /// Pops scripted replies in order and remembers every prompt.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new<I, S>(replies: I) -> Arc<Self>
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn remaining(&self) -> usize {
            self.replies.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<Completion, LanguageModelError> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.last_user_message().to_string());
            let reply = self.replies.lock().unwrap().pop_front();
            reply
                .map(Completion::new)
                .ok_or_else(|| LanguageModelError::message("no scripted reply left"))
        }
    }

    pub fn assistant(model: Arc<ScriptedModel>) -> NovelAssistant {
        NovelAssistant::new(
            Arc::new(LlmService::new(model)),
            Arc::new(PromptLibrary::new().unwrap()),
        )
    }
}
