use async_trait::async_trait;
use futures::future::try_join_all;
use log::{info, warn};
use serde_json::{json, Map, Value};

use super::models::WorldSetting;
use super::{text_param, NovelAssistant, WORLD_BUILDER};
use crate::parsing::{clean_response, extract_json_object, merge_defaults, string_list};
use crate::tool::{
    ParameterType, Parameters, Tool, ToolContext, ToolDefinition, ToolError, ToolParameter,
};

const DETAIL_AREAS: [(&str, &str); 4] = [
    ("politics", "政治格局"),
    ("economy", "经济体系"),
    ("culture", "文化风俗"),
    ("history", "历史沿革"),
];

/// Values used for every field the model leaves out.
pub fn default_world() -> Value {
    json!({
        "name": "未命名世界",
        "type": "大陆",
        "time_period": "古代",
        "technology_level": "中世纪",
        "magic_prevalence": "高",
        "political_system": "封建制",
        "major_races": ["人族", "妖族"],
        "major_kingdoms": [{"name": "东方王国", "description": "强大的人族王国"}],
        "natural_features": ["高山", "森林", "河流"],
        "unique_elements": ["灵气", "仙境"],
        "history_timeline": [{"period": "远古时代", "event": "世界诞生"}],
        "culture_notes": "修仙文化盛行",
        "economy_system": "以物易物和货币并存",
        "languages": ["通用语", "古语"]
    })
}

pub struct WorldBuilderTool {
    definition: ToolDefinition,
    assistant: NovelAssistant,
}

impl WorldBuilderTool {
    pub fn new(assistant: NovelAssistant) -> Self {
        let definition = ToolDefinition::new(WORLD_BUILDER, "根据类型与主题生成完整的世界观设定")
            .with_category("worldbuilding")
            .parameter(
                ToolParameter::new("genre", ParameterType::String, "小说类型").with_default("玄幻"),
            )
            .parameter(
                ToolParameter::new("theme", ParameterType::String, "核心主题").with_default("修仙"),
            )
            .parameter(
                ToolParameter::new("scale", ParameterType::String, "世界规模，如 大陆/星球/位面")
                    .with_default("大陆"),
            )
            .parameter(
                ToolParameter::new("detail_level", ParameterType::String, "详细程度")
                    .with_default("basic")
                    .with_enum(["basic", "detailed"]),
            )
            .parameter(
                ToolParameter::new("focus_areas", ParameterType::Any, "重点关注的领域").optional(),
            )
            .example(
                json!({"genre": "仙侠", "theme": "问道长生", "detail_level": "detailed"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                json!({"world": {"name": "九州", "type": "大陆"}}),
            )
            .tag("world")
            .tag("setting");
        Self {
            definition,
            assistant,
        }
    }

    async fn basic_setting(
        &self,
        genre: &str,
        theme: &str,
        scale: &str,
        focus: &str,
    ) -> Result<Map<String, Value>, ToolError> {
        let reply = self
            .assistant
            .ask(
                "world",
                "basic",
                [
                    ("genre", genre),
                    ("theme", theme),
                    ("scale", scale),
                    ("focus_areas", focus),
                ],
            )
            .await?;
        if let Some(parsed) = extract_json_object(&reply) {
            return Ok(parsed);
        }

        warn!("世界设定不是有效的 JSON，尝试重新整理");
        let restructured = self
            .assistant
            .ask("world", "structure", [("raw_text", reply)])
            .await?;
        Ok(extract_json_object(&restructured).unwrap_or_else(|| {
            warn!("重新整理后仍无法解析世界设定，使用默认设定");
            Map::new()
        }))
    }

    async fn expand(&self, world: &mut WorldSetting) -> Result<(), ToolError> {
        let summary = world.summary();
        let details = try_join_all(DETAIL_AREAS.iter().map(|(key, label)| {
            let summary = summary.clone();
            let name = world.name.clone();
            let world_type = world.world_type.clone();
            async move {
                let text = self
                    .assistant
                    .ask(
                        "world",
                        "detail",
                        [
                            ("world_name", name),
                            ("world_type", world_type),
                            ("world_summary", summary),
                            ("area", label.to_string()),
                        ],
                    )
                    .await?;
                Ok::<_, ToolError>((key.to_string(), clean_response(&text)))
            }
        }))
        .await?;
        world.details.extend(details);

        let reply = self
            .assistant
            .ask("world", "conflicts", [("world_summary", summary)])
            .await?;
        match extract_json_object(&reply) {
            Some(parsed) => {
                world.conflicts = array_field(&parsed, "conflicts");
                world.mysteries = array_field(&parsed, "mysteries");
            }
            None => warn!("冲突与谜团解析失败，已跳过"),
        }
        Ok(())
    }
}

fn array_field(map: &Map<String, Value>, key: &str) -> Vec<Value> {
    match map.get(key) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Tool for WorldBuilderTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        _context: &ToolContext,
    ) -> Result<Value, ToolError> {
        let genre = text_param(parameters, "genre", "玄幻");
        let theme = text_param(parameters, "theme", "修仙");
        let scale = text_param(parameters, "scale", "大陆");
        let detail_level = text_param(parameters, "detail_level", "basic");
        let focus_areas = string_list(parameters.get("focus_areas"));
        let focus = if focus_areas.is_empty() {
            "地理、势力、修炼体系".to_string()
        } else {
            focus_areas.join("、")
        };

        info!("开始构建世界: {genre}/{theme}（{detail_level}）");
        let parsed = self.basic_setting(genre, theme, scale, &focus).await?;
        let mut world = WorldSetting::from_value(&merge_defaults(default_world(), parsed));

        if detail_level == "detailed" {
            self.expand(&mut world).await?;
        }

        Ok(json!({
            "world": world,
            "generation_info": {
                "genre": genre,
                "theme": theme,
                "scale": scale,
                "detail_level": detail_level,
                "focus_areas": focus_areas,
            }
        }))
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
    async fn parses_fenced_json_and_fills_gaps() {
        let model = ScriptedModel::new([
            "```json\n{\"name\": \"青云界\", \"major_races\": [\"人族\", \"龙族\"], \"languages\": null}\n```",
        ]);
        let tool = WorldBuilderTool::new(assistant(model.clone()));

        let response = safe_execute(&tool, "w1", &params(json!({"genre": "仙侠"})), &Map::new()).await;
        assert!(response.success, "{}", response.error_message());

        let world = &response.result["world"];
        assert_eq!(world["name"], "青云界");
        assert_eq!(world["major_races"], json!(["人族", "龙族"]));
        assert_eq!(world["languages"], json!(["通用语", "古语"]));
        assert_eq!(world["political_system"], "封建制");
        assert_eq!(response.result["generation_info"]["detail_level"], "basic");
        assert!(model.prompts.lock().unwrap()[0].contains("仙侠"));
    }

    #[tokio::test]
    async fn restructures_prose_then_falls_back_to_defaults() {
        let model = ScriptedModel::new(["这是一个灵气充沛的大陆", "依旧没有 JSON"]);
        let tool = WorldBuilderTool::new(assistant(model.clone()));

        let response = safe_execute(&tool, "w2", &Map::new(), &Map::new()).await;
        assert!(response.success);
        assert_eq!(response.result["world"]["name"], "未命名世界");

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("这是一个灵气充沛的大陆"));
    }

    #[tokio::test]
    async fn detailed_worlds_gain_details_and_conflicts() {
        let model = ScriptedModel::new([
            "{\"name\": \"九州\"}".to_string(),
            "政治".to_string(),
            "经济".to_string(),
            "文化".to_string(),
            "历史".to_string(),
            "{\"conflicts\": [{\"name\": \"正邪之争\"}], \"mysteries\": [{\"name\": \"上古遗迹\"}]}"
                .to_string(),
        ]);
        let tool = WorldBuilderTool::new(assistant(model.clone()));

        let response = safe_execute(
            &tool,
            "w3",
            &params(json!({"detail_level": "detailed", "focus_areas": ["宗门", "秘境"]})),
            &Map::new(),
        )
        .await;
        assert!(response.success, "{}", response.error_message());

        let world = &response.result["world"];
        assert_eq!(world["details"].as_object().unwrap().len(), 4);
        assert_eq!(world["conflicts"][0]["name"], "正邪之争");
        assert_eq!(world["mysteries"][0]["name"], "上古遗迹");
        assert_eq!(model.remaining(), 0);
        assert!(model.prompts.lock().unwrap()[0].contains("宗门、秘境"));
    }

    #[tokio::test]
    async fn rejects_unknown_detail_level() {
        let model = ScriptedModel::new(Vec::<String>::new());
        let tool = WorldBuilderTool::new(assistant(model));
        let response = safe_execute(
            &tool,
            "w4",
            &params(json!({"detail_level": "extreme"})),
            &Map::new(),
        )
        .await;
        assert!(!response.success);
        assert!(response.error_message().contains("detail_level"));
    }
}
