use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::models::{ChapterPlan, PlotPoint, StoryOutline};
use super::{
    character_summaries, count_param, text_param, world_summary, NovelAssistant, STORY_PLANNER,
};
use crate::parsing::extract_json_object;
use crate::tool::{
    ParameterType, Parameters, Tool, ToolContext, ToolDefinition, ToolError, ToolParameter,
};

const MAX_CHAPTERS: u64 = 500;

/// Tension rises through the first three quarters of the story and eases off
/// in the last one, never below 6.
pub fn tension_for(chapter: u32, total: u32) -> u8 {
    let position = f64::from(chapter) / f64::from(total.max(1));
    let level = if position < 0.25 {
        (3 + (position * 12.0) as i32).min(5)
    } else if position < 0.75 {
        (5 + ((position - 0.25) * 16.0) as i32).min(9)
    } else {
        (9 - ((position - 0.75) * 12.0) as i32).max(6)
    };
    level.clamp(1, 10) as u8
}

fn mood_for(tension: u8) -> &'static str {
    match tension {
        8.. => "紧张刺激",
        6..=7 => "严肃专注",
        4..=5 => "轻松活泼",
        _ => "平静祥和",
    }
}

/// Plan for a chapter the model did not describe.
pub fn backfill_plan(number: u32, total: u32, plot_points: &[PlotPoint]) -> ChapterPlan {
    let tension = tension_for(number, total);
    let events: Vec<&PlotPoint> = plot_points.iter().filter(|p| p.chapter == number).collect();
    ChapterPlan {
        number,
        title: format!("第{number}章"),
        summary: events
            .iter()
            .map(|p| p.description.as_str())
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join("；"),
        key_events: events.iter().map(|p| p.name.clone()).collect(),
        character_focus: Vec::new(),
        tension_level: tension,
        pacing: if events.is_empty() { "medium" } else { "fast" }.to_string(),
        mood: mood_for(tension).to_string(),
    }
}

/// Keeps the first plan for each chapter in `1..=total` and fills every gap.
/// Returns how many plans were back-filled.
fn normalize_chapters(outline: &mut StoryOutline, total: u32) -> usize {
    let mut by_number: BTreeMap<u32, ChapterPlan> = BTreeMap::new();
    for (index, mut plan) in std::mem::take(&mut outline.chapters).into_iter().enumerate() {
        if plan.number == 0 {
            plan.number = index as u32 + 1;
        }
        if plan.number <= total {
            by_number.entry(plan.number).or_insert(plan);
        }
    }

    let mut backfilled = 0;
    outline.chapters = (1..=total)
        .map(|number| match by_number.remove(&number) {
            Some(mut plan) => {
                if plan.title.trim().is_empty() {
                    plan.title = format!("第{number}章");
                }
                if plan.mood.trim().is_empty() {
                    plan.mood = mood_for(plan.tension_level).to_string();
                }
                plan
            }
            None => {
                backfilled += 1;
                backfill_plan(number, total, &outline.plot_points)
            }
        })
        .collect();
    backfilled
}

pub struct StoryPlannerTool {
    definition: ToolDefinition,
    assistant: NovelAssistant,
}

impl StoryPlannerTool {
    pub fn new(assistant: NovelAssistant) -> Self {
        let definition = ToolDefinition::new(STORY_PLANNER, "规划故事大纲与逐章计划")
            .with_category("plot")
            .parameter(ToolParameter::new("title", ParameterType::String, "小说标题"))
            .parameter(
                ToolParameter::new("genre", ParameterType::String, "小说类型").with_default("玄幻"),
            )
            .parameter(
                ToolParameter::new("chapter_count", ParameterType::Integer, "章节数")
                    .with_default(20),
            )
            .parameter(
                ToolParameter::new("structure", ParameterType::String, "情节结构：三幕式/英雄之旅/七点式等")
                    .with_default("三幕式"),
            )
            .parameter(
                ToolParameter::new("theme", ParameterType::String, "故事主题").with_default("成长"),
            )
            .parameter(
                ToolParameter::new("characters", ParameterType::Any, "主要角色").optional(),
            )
            .parameter(
                ToolParameter::new("world_setting", ParameterType::Any, "世界设定").optional(),
            )
            .example(
                json!({"title": "星辰变", "chapter_count": 30, "structure": "英雄之旅"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                json!({"outline": {"title": "星辰变", "chapters": []}}),
            )
            .tag("outline")
            .tag("plot");
        Self {
            definition,
            assistant,
        }
    }
}

#[async_trait]
impl Tool for StoryPlannerTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.definition.validate_parameters(parameters)?;
        if str_is_blank(parameters.get("title")) {
            return Err(ToolError::InvalidParameter {
                name: "title".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let count = count_param(parameters, "chapter_count", 20);
        if !(1..=MAX_CHAPTERS).contains(&count) {
            return Err(ToolError::InvalidParameter {
                name: "chapter_count".to_string(),
                reason: format!("must be between 1 and {MAX_CHAPTERS}"),
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        _context: &ToolContext,
    ) -> Result<Value, ToolError> {
        let title = text_param(parameters, "title", "").trim();
        let genre = text_param(parameters, "genre", "玄幻");
        let structure = text_param(parameters, "structure", "三幕式");
        let theme = text_param(parameters, "theme", "成长");
        let chapter_count = count_param(parameters, "chapter_count", 20) as u32;
        let characters = character_summaries(parameters.get("characters"));
        let characters = if characters.is_empty() {
            "待定".to_string()
        } else {
            characters.join("；")
        };

        info!("开始规划《{title}》大纲，共 {chapter_count} 章（{structure}）");
        let reply = self
            .assistant
            .ask(
                "plot",
                "outline",
                [
                    ("title", title.to_string()),
                    ("genre", genre.to_string()),
                    ("theme", theme.to_string()),
                    ("structure", structure.to_string()),
                    ("chapter_count", chapter_count.to_string()),
                    ("characters", characters),
                    ("world_summary", world_summary(parameters.get("world_setting"))),
                ],
            )
            .await?;
        let parsed = extract_json_object(&reply)
            .ok_or_else(|| ToolError::Parse("故事大纲不是有效的 JSON".to_string()))?;

        let mut outline: StoryOutline = serde_json::from_value(Value::Object(parsed))?;
        outline.title = title.to_string();
        outline.structure = structure.to_string();
        let planned = outline.chapters.len();
        let backfilled = normalize_chapters(&mut outline, chapter_count);
        if backfilled > 0 {
            warn!("大纲缺少 {backfilled} 章的计划，已自动补全");
        }

        Ok(json!({
            "outline": outline,
            "generation_info": {
                "genre": genre,
                "theme": theme,
                "structure": structure,
                "chapter_count": chapter_count,
                "planned_by_model": planned,
                "backfilled": backfilled,
            }
        }))
    }
}

fn str_is_blank(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .map_or(false, |text| text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::novel::testing::{assistant, ScriptedModel};
    use crate::tool::safe_execute;
    use serde_json::Map;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn tension_curve_matches_three_acts() {
        let curve: Vec<u8> = (1..=8).map(|n| tension_for(n, 8)).collect();
        assert_eq!(curve, vec![4, 5, 7, 9, 9, 9, 8, 6]);
        assert_eq!(mood_for(9), "紧张刺激");
        assert_eq!(mood_for(3), "平静祥和");
    }

    #[tokio::test]
    async fn backfills_missing_and_drops_extra_chapters() {
        let model = ScriptedModel::new([r#"{
            "premise": "少年逆天改命",
            "plot_points": [{"name": "宗门大比", "chapter": 3, "description": "主角一鸣惊人"}],
            "chapters": [
                {"number": 1, "title": "落魄少年", "summary": "开端"},
                {"number": 1, "title": "重复"},
                {"number": 4, "title": "越界"},
                {"title": "无编号", "summary": "按位置编为第4章后被丢弃"}
            ]
        }"#]);
        let tool = StoryPlannerTool::new(assistant(model.clone()));

        let response = safe_execute(
            &tool,
            "p1",
            &params(json!({
                "title": "逆天",
                "chapter_count": 3,
                "characters": {"characters": [{"name": "林枫", "character_type": "主角"}]}
            })),
            &Map::new(),
        )
        .await;
        assert!(response.success, "{}", response.error_message());

        let outline: StoryOutline =
            serde_json::from_value(response.result["outline"].clone()).unwrap();
        assert_eq!(outline.title, "逆天");
        assert_eq!(outline.structure, "三幕式");
        let numbers: Vec<u32> = outline.chapters.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(outline.chapters[0].title, "落魄少年");
        assert_eq!(outline.chapters[1].title, "第2章");
        assert_eq!(outline.chapters[2].title, "第3章");
        assert_eq!(outline.chapters[2].key_events, vec!["宗门大比"]);
        assert_eq!(outline.chapters[2].pacing, "fast");
        assert_eq!(response.result["generation_info"]["backfilled"], 2);
        assert!(model.prompts.lock().unwrap()[0].contains("林枫（主角）"));
    }

    #[tokio::test]
    async fn title_is_required() {
        let model = ScriptedModel::new(Vec::<String>::new());
        let tool = StoryPlannerTool::new(assistant(model));

        let missing = safe_execute(&tool, "p2", &Map::new(), &Map::new()).await;
        assert!(!missing.success);
        assert!(missing.error_message().contains("title"));

        let blank = safe_execute(&tool, "p3", &params(json!({"title": "  "})), &Map::new()).await;
        assert!(!blank.success);
    }
}
