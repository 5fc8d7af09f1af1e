use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::models::{Chapter, Character, Novel, NovelStatus, StoryOutline, WorldSetting};
use super::storage::{NovelStore, StorageError};
use super::{CHAPTER_WRITER, CHARACTER_CREATOR, STORY_PLANNER, WORLD_BUILDER};
use crate::config::NovelConfig;
use crate::logging::{LogLevel, LogRecord, NullLogSink, SharedLogSink};
use crate::tool::{ToolCall, ToolContext, ToolRegistry, ToolResponse};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStep {
    World,
    Characters,
    Outline,
    Chapter(u32),
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStep::World => f.write_str("world"),
            PipelineStep::Characters => f.write_str("characters"),
            PipelineStep::Outline => f.write_str("outline"),
            PipelineStep::Chapter(number) => write!(f, "chapter {number}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{step} step failed: {message}")]
    Step { step: PipelineStep, message: String },
    #[error("{step} step returned unusable data: {reason}")]
    InvalidResult { step: PipelineStep, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn step(&self) -> Option<PipelineStep> {
        match self {
            PipelineError::Step { step, .. } | PipelineError::InvalidResult { step, .. } => {
                Some(*step)
            }
            PipelineError::Storage(_) => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerationRequest {
    pub title: String,
    pub genre: String,
    pub theme: String,
    pub chapter_count: u32,
    pub words_per_chapter: u32,
    pub writing_style: String,
    pub structure: String,
    pub world_detail: String,
    pub supporting_characters: u32,
}

impl GenerationRequest {
    /// Request pre-filled with the configured defaults.
    pub fn from_config(title: impl Into<String>, config: &NovelConfig) -> Self {
        Self {
            title: title.into(),
            genre: config.default_genre.clone(),
            theme: "成长".to_string(),
            chapter_count: config.default_chapter_count,
            words_per_chapter: config.default_word_count,
            writing_style: config.writing_style.clone(),
            structure: "三幕式".to_string(),
            world_detail: "basic".to_string(),
            supporting_characters: config.supporting_characters,
        }
    }
}

/// Drives the novel tools through a registry: world, cast, outline, chapters.
pub struct NovelGenerator {
    registry: Arc<ToolRegistry>,
    sink: SharedLogSink,
    store: Option<NovelStore>,
}

impl NovelGenerator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            sink: Arc::new(NullLogSink),
            store: None,
        }
    }

    pub fn with_log_sink(mut self, sink: SharedLogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Persists the novel after generation, and the partial novel when a step fails.
    pub fn with_store(mut self, store: NovelStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<Novel, PipelineError> {
        let mut novel = Novel::new(&request.title, &request.genre, &request.theme);
        novel.writing_style = request.writing_style.clone();
        novel.status = NovelStatus::Generating;
        self.log(LogLevel::Info, format!("开始生成小说《{}》", request.title));

        match self.run(request, &mut novel).await {
            Ok(()) => {
                novel.status = NovelStatus::Completed;
                novel.touch();
                self.log(
                    LogLevel::Info,
                    format!(
                        "小说《{}》生成完成：{} 章，共 {} 字",
                        novel.title,
                        novel.chapters.len(),
                        novel.total_word_count()
                    ),
                );
                if let Some(store) = &self.store {
                    let dir = store.save(&novel)?;
                    self.log(LogLevel::Info, format!("已保存到 {}", dir.display()));
                }
                Ok(novel)
            }
            Err(err) => {
                novel.status = NovelStatus::Failed;
                novel.touch();
                self.log(LogLevel::Error, format!("生成失败: {err}"));
                if let Some(store) = &self.store {
                    if let Err(save_err) = store.save(&novel) {
                        self.log(LogLevel::Warn, format!("保存未完成的小说失败: {save_err}"));
                    }
                }
                Err(err)
            }
        }
    }

    async fn run(&self, request: &GenerationRequest, novel: &mut Novel) -> Result<(), PipelineError> {
        let context = ToolContext::new();

        self.log(LogLevel::Info, "步骤 1/4：构建世界观".to_string());
        let response = self
            .registry
            .execute(
                WORLD_BUILDER,
                params(json!({
                    "genre": request.genre,
                    "theme": request.theme,
                    "detail_level": request.world_detail,
                })),
                &context,
            )
            .await;
        let world_value = field(expect_success(PipelineStep::World, response)?, "world")
            .ok_or_else(|| invalid(PipelineStep::World, "missing `world`"))?;
        let world = WorldSetting::from_value(&world_value);
        self.log(LogLevel::Info, format!("世界观完成：{}", world.name));
        novel.world = Some(world);

        self.log(LogLevel::Info, "步骤 2/4：创建角色".to_string());
        novel.characters = self.create_cast(request, &world_value, &context).await?;
        let names: Vec<&str> = novel.characters.iter().map(|c| c.name.as_str()).collect();
        self.log(LogLevel::Info, format!("角色完成：{}", names.join("、")));
        let characters_value = serde_json::to_value(&novel.characters)
            .map_err(|err| invalid(PipelineStep::Characters, err.to_string()))?;

        self.log(LogLevel::Info, "步骤 3/4：规划大纲".to_string());
        let response = self
            .registry
            .execute(
                STORY_PLANNER,
                params(json!({
                    "title": request.title,
                    "genre": request.genre,
                    "theme": request.theme,
                    "chapter_count": request.chapter_count,
                    "structure": request.structure,
                    "characters": characters_value,
                    "world_setting": world_value,
                })),
                &context,
            )
            .await;
        let outline_value = field(expect_success(PipelineStep::Outline, response)?, "outline")
            .ok_or_else(|| invalid(PipelineStep::Outline, "missing `outline`"))?;
        let outline: StoryOutline = serde_json::from_value(outline_value)
            .map_err(|err| invalid(PipelineStep::Outline, err.to_string()))?;
        let plans = outline.chapters.clone();
        novel.outline = Some(outline);

        self.log(LogLevel::Info, format!("步骤 4/4：撰写 {} 个章节", plans.len()));
        let mut previous_summary = String::new();
        for plan in plans {
            let step = PipelineStep::Chapter(plan.number);
            let response = self
                .registry
                .execute(
                    CHAPTER_WRITER,
                    params(json!({
                        "chapter_info": plan,
                        "story_context": {
                            "novel_title": request.title,
                            "genre": request.genre,
                            "world": world_value,
                            "characters": characters_value,
                            "previous_summary": previous_summary,
                        },
                        "writing_style": request.writing_style,
                        "target_word_count": request.words_per_chapter,
                    })),
                    &context,
                )
                .await;
            let chapter_value = field(expect_success(step, response)?, "chapter")
                .ok_or_else(|| invalid(step, "missing `chapter`"))?;
            let chapter: Chapter = serde_json::from_value(chapter_value)
                .map_err(|err| invalid(step, err.to_string()))?;
            self.log(
                LogLevel::Info,
                format!("第 {} 章「{}」完成，{} 字", chapter.number, chapter.title, chapter.word_count),
            );
            previous_summary = if chapter.summary.is_empty() {
                chapter.title.clone()
            } else {
                chapter.summary.clone()
            };
            novel.chapters.push(chapter);
            novel.touch();
        }
        Ok(())
    }

    /// Protagonist, antagonist and supporting cast are created in one batch.
    async fn create_cast(
        &self,
        request: &GenerationRequest,
        world: &Value,
        context: &ToolContext,
    ) -> Result<Vec<Character>, PipelineError> {
        let mut roles = vec![("主角", 1), ("反派", 1)];
        if request.supporting_characters > 0 {
            roles.push(("重要配角", request.supporting_characters));
        }
        let calls: Vec<ToolCall> = roles
            .iter()
            .map(|(role, count)| {
                ToolCall::from_value(
                    CHARACTER_CREATOR,
                    json!({
                        "character_type": role,
                        "genre": request.genre,
                        "count": count,
                        "world_setting": world,
                    }),
                )
            })
            .collect();

        let mut cast = Vec::new();
        for response in self.registry.batch_execute(&calls, context).await {
            let value = field(expect_success(PipelineStep::Characters, response)?, "characters")
                .ok_or_else(|| invalid(PipelineStep::Characters, "missing `characters`"))?;
            let characters: Vec<Character> = serde_json::from_value(value)
                .map_err(|err| invalid(PipelineStep::Characters, err.to_string()))?;
            cast.extend(characters);
        }
        Ok(cast)
    }

    fn log(&self, level: LogLevel, message: String) {
        self.sink.log(LogRecord::new(level, message).with_target("pipeline"));
    }
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn expect_success(step: PipelineStep, response: ToolResponse) -> Result<Value, PipelineError> {
    if response.success {
        Ok(response.result)
    } else {
        Err(PipelineError::Step {
            step,
            message: response.error_message().to_string(),
        })
    }
}

fn field(mut value: Value, key: &str) -> Option<Value> {
    value.as_object_mut()?.remove(key)
}

fn invalid(step: PipelineStep, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidResult {
        step,
        reason: reason.into(),
    }
}
