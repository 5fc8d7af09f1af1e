use async_trait::async_trait;
use chrono::Utc;
use log::info;
use serde_json::{json, Map, Value};

use super::models::{Chapter, ChapterPlan};
use super::{character_summaries, count_param, world_summary, NovelAssistant, CHAPTER_WRITER};
use crate::parsing::{clean_response, count_words, str_field};
use crate::tool::{
    ParameterType, Parameters, Tool, ToolContext, ToolDefinition, ToolError, ToolParameter,
};

/// Known styles and the guidance handed to the model for each.
pub const WRITING_STYLES: [(&str, &str); 4] = [
    ("traditional", "古典优雅，句式适中，略带文言色彩，描写细腻"),
    ("modern", "现代直白，短句为主，使用现代白话"),
    ("poetic", "诗意浪漫，句式长短交错，语言富有诗性，大量意象描写"),
    ("action", "紧张刺激，短句为主，动感强烈，描写精炼"),
];

/// Unknown styles are passed to the model verbatim.
pub fn style_description(style: &str) -> &str {
    WRITING_STYLES
        .iter()
        .find(|(name, _)| *name == style)
        .map(|(_, description)| *description)
        .unwrap_or(style)
}

/// Share of characters spoken inside quotation marks, rounded to two decimals.
pub fn dialogue_ratio(content: &str) -> f64 {
    let total = content.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mut in_dialogue = false;
    let mut spoken = 0usize;
    for ch in content.chars() {
        match ch {
            '“' | '「' => in_dialogue = true,
            '”' | '」' => in_dialogue = false,
            '"' => in_dialogue = !in_dialogue,
            _ if in_dialogue => spoken += 1,
            _ => {}
        }
    }
    (spoken as f64 / total as f64 * 100.0).round() / 100.0
}

pub struct ChapterWriterTool {
    definition: ToolDefinition,
    assistant: NovelAssistant,
}

impl ChapterWriterTool {
    pub fn new(assistant: NovelAssistant) -> Self {
        let definition = ToolDefinition::new(CHAPTER_WRITER, "根据章节计划与故事上下文撰写章节正文")
            .with_category("writing")
            .parameter(ToolParameter::new(
                "chapter_info",
                ParameterType::Object,
                "章节计划：number/title/summary/key_events/character_focus/mood/pacing",
            ))
            .parameter(ToolParameter::new(
                "story_context",
                ParameterType::Object,
                "故事上下文：novel_title/genre/world/characters/previous_summary",
            ))
            .parameter(
                ToolParameter::new(
                    "writing_style",
                    ParameterType::String,
                    "写作风格：traditional/modern/poetic/action",
                )
                .with_default("traditional"),
            )
            .parameter(
                ToolParameter::new("target_word_count", ParameterType::Integer, "目标字数")
                    .with_default(3000),
            )
            .example(
                json!({
                    "chapter_info": {"number": 1, "title": "初入宗门", "summary": "少年拜入青云宗"},
                    "story_context": {"novel_title": "青云志", "genre": "仙侠"},
                    "writing_style": "traditional",
                    "target_word_count": 3000
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
                json!({"chapter": {"number": 1, "title": "初入宗门"}}),
            )
            .tag("chapter")
            .tag("writing");
        Self {
            definition,
            assistant,
        }
    }
}

#[async_trait]
impl Tool for ChapterWriterTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.definition.validate_parameters(parameters)?;
        let plan = parameters
            .get("chapter_info")
            .cloned()
            .map(serde_json::from_value::<ChapterPlan>)
            .transpose()
            .map_err(|err| ToolError::InvalidParameter {
                name: "chapter_info".to_string(),
                reason: err.to_string(),
            })?;
        if plan.map_or(true, |plan| plan.number == 0) {
            return Err(ToolError::InvalidParameter {
                name: "chapter_info".to_string(),
                reason: "chapter number must be a positive integer".to_string(),
            });
        }
        if count_param(parameters, "target_word_count", 3000) == 0 {
            return Err(ToolError::InvalidParameter {
                name: "target_word_count".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        _context: &ToolContext,
    ) -> Result<Value, ToolError> {
        let plan: ChapterPlan = serde_json::from_value(
            parameters
                .get("chapter_info")
                .cloned()
                .unwrap_or(Value::Null),
        )?;
        let empty = Map::new();
        let story = parameters
            .get("story_context")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let style = str_field(parameters, "writing_style", "traditional");
        let target = count_param(parameters, "target_word_count", 3000);

        let title = if plan.title.trim().is_empty() {
            format!("第{}章", plan.number)
        } else {
            plan.title.clone()
        };
        let characters = if plan.character_focus.is_empty() {
            character_summaries(story.get("characters"))
        } else {
            plan.character_focus.clone()
        };
        let previous = str_field(story, "previous_summary", "");

        info!("开始撰写第 {} 章「{}」", plan.number, title);
        let reply = self
            .assistant
            .ask(
                "chapter",
                "write",
                [
                    ("novel_title", str_field(story, "novel_title", "未命名").to_string()),
                    ("genre", str_field(story, "genre", "玄幻").to_string()),
                    ("chapter_number", plan.number.to_string()),
                    ("chapter_title", title.clone()),
                    ("chapter_summary", or_none(&plan.summary)),
                    ("key_events", or_none(&plan.key_events.join("、"))),
                    ("characters", or_none(&characters.join("；"))),
                    ("mood", or_none(&plan.mood)),
                    ("pacing", or_none(&plan.pacing)),
                    ("world_summary", world_summary(story.get("world"))),
                    (
                        "previous_summary",
                        if previous.trim().is_empty() {
                            "这是故事的开篇".to_string()
                        } else {
                            previous.to_string()
                        },
                    ),
                    ("writing_style", style_description(style).to_string()),
                    ("target_word_count", target.to_string()),
                ],
            )
            .await?;

        let content = clean_response(&reply);
        if content.is_empty() {
            return Err(ToolError::Parse(format!(
                "第 {} 章的返回内容为空",
                plan.number
            )));
        }

        let summary = clean_response(
            &self
                .assistant
                .ask("chapter", "summarize", [("chapter_text", content.as_str())])
                .await?,
        );
        let word_count = count_words(&content);
        let ratio = dialogue_ratio(&content);

        let chapter = Chapter {
            number: plan.number,
            title,
            word_count,
            summary,
            content,
            created_at: Utc::now(),
        };

        Ok(json!({
            "chapter": chapter,
            "analysis": {
                "word_count": word_count,
                "target_word_count": target,
                "completion": (word_count as f64 / target.max(1) as f64 * 100.0).round() / 100.0,
                "dialogue_ratio": ratio,
                "writing_style": style,
            }
        }))
    }
}

fn or_none(text: &str) -> String {
    if text.trim().is_empty() {
        "无".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::novel::testing::{assistant, ScriptedModel};
    use crate::tool::safe_execute;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn writes_and_summarizes_a_chapter() {
        let model = ScriptedModel::new([
            "<think>构思</think>林枫推开山门。“到了。”他说。",
            "林枫抵达宗门。",
        ]);
        let tool = ChapterWriterTool::new(assistant(model.clone()));

        let response = safe_execute(
            &tool,
            "ch1",
            &params(json!({
                "chapter_info": {"number": 2, "title": "山门", "key_events": ["入门"]},
                "story_context": {
                    "novel_title": "青云志",
                    "previous_summary": "少年离家",
                    "characters": ["林枫"]
                },
                "writing_style": "modern",
                "target_word_count": 10
            })),
            &Map::new(),
        )
        .await;
        assert!(response.success, "{}", response.error_message());

        let chapter: Chapter =
            serde_json::from_value(response.result["chapter"].clone()).unwrap();
        assert_eq!(chapter.number, 2);
        assert_eq!(chapter.content, "林枫推开山门。“到了。”他说。");
        assert_eq!(chapter.summary, "林枫抵达宗门。");
        assert_eq!(chapter.word_count, count_words(&chapter.content));

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("少年离家"));
        assert!(prompts[0].contains("现代直白"));
        assert!(prompts[0].contains("林枫"));
        assert!(prompts[1].contains("林枫推开山门"));
    }

    #[tokio::test]
    async fn chapter_number_is_required() {
        let model = ScriptedModel::new(Vec::<String>::new());
        let tool = ChapterWriterTool::new(assistant(model));
        let response = safe_execute(
            &tool,
            "ch2",
            &params(json!({"chapter_info": {"title": "无号"}, "story_context": {}})),
            &Map::new(),
        )
        .await;
        assert!(!response.success);
        assert!(response.error_message().contains("chapter_info"));
    }

    #[test]
    fn dialogue_ratio_counts_quoted_text() {
        assert_eq!(dialogue_ratio(""), 0.0);
        assert_eq!(dialogue_ratio("“你好”"), 0.5);
        assert_eq!(dialogue_ratio("「走」他说"), 0.2);
        assert_eq!(style_description("gothic"), "gothic");
    }
}
