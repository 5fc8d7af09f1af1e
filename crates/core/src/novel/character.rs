use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

use super::models::Character;
use super::{count_param, text_param, world_summary, NovelAssistant, CHARACTER_CREATOR};
use crate::parsing::{extract_json_object, string_list};
use crate::tool::{
    ParameterType, Parameters, Tool, ToolContext, ToolDefinition, ToolError, ToolParameter,
};

const MAX_PER_CALL: u64 = 10;

pub struct CharacterCreatorTool {
    definition: ToolDefinition,
    assistant: NovelAssistant,
}

impl CharacterCreatorTool {
    pub fn new(assistant: NovelAssistant) -> Self {
        let definition = ToolDefinition::new(CHARACTER_CREATOR, "创建具有完整背景与性格的小说角色")
            .with_category("character")
            .parameter(
                ToolParameter::new("character_type", ParameterType::String, "角色类型，如 主角/反派/导师")
                    .with_default("主角"),
            )
            .parameter(
                ToolParameter::new("genre", ParameterType::String, "小说类型").with_default("玄幻"),
            )
            .parameter(
                ToolParameter::new("count", ParameterType::Integer, "生成数量").with_default(1),
            )
            .parameter(
                ToolParameter::new("world_setting", ParameterType::Any, "世界设定").optional(),
            )
            .parameter(
                ToolParameter::new("requirements", ParameterType::String, "额外要求").optional(),
            )
            .parameter(
                ToolParameter::new("existing_names", ParameterType::Array, "需要避开的已有角色名")
                    .optional(),
            )
            .example(
                json!({"character_type": "反派", "genre": "仙侠", "count": 1})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                json!({"characters": [{"name": "血煞老祖", "character_type": "反派"}]}),
            )
            .tag("character");
        Self {
            definition,
            assistant,
        }
    }
}

/// Appends a counter until `name` no longer collides with `taken`.
fn unique_name(name: &str, taken: &[String]) -> String {
    if !taken.iter().any(|existing| existing == name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name}{n}"))
        .find(|candidate| !taken.iter().any(|existing| existing == candidate))
        .unwrap_or_else(|| name.to_string())
}

#[async_trait]
impl Tool for CharacterCreatorTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.definition.validate_parameters(parameters)?;
        let count = count_param(parameters, "count", 1);
        if !(1..=MAX_PER_CALL).contains(&count) {
            return Err(ToolError::InvalidParameter {
                name: "count".to_string(),
                reason: format!("must be between 1 and {MAX_PER_CALL}"),
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        _context: &ToolContext,
    ) -> Result<Value, ToolError> {
        let character_type = text_param(parameters, "character_type", "主角");
        let genre = text_param(parameters, "genre", "玄幻");
        let requirements = text_param(parameters, "requirements", "无");
        let count = count_param(parameters, "count", 1);
        let world = world_summary(parameters.get("world_setting"));
        let mut taken = string_list(parameters.get("existing_names"));

        info!("开始创建 {count} 个{character_type}角色");
        let mut characters = Vec::new();
        for index in 1..=count {
            let existing = if taken.is_empty() {
                "无".to_string()
            } else {
                taken.join("、")
            };
            let reply = self
                .assistant
                .ask(
                    "character",
                    "create",
                    [
                        ("genre", genre.to_string()),
                        ("character_type", character_type.to_string()),
                        ("world_summary", world.clone()),
                        ("requirements", requirements.to_string()),
                        ("existing_names", existing),
                    ],
                )
                .await?;
            let parsed = extract_json_object(&reply).ok_or_else(|| {
                ToolError::Parse(format!("第 {index} 个角色的返回内容不是有效的 JSON"))
            })?;

            let mut character: Character = serde_json::from_value(Value::Object(parsed))?;
            let base_name = if character.name.trim().is_empty() {
                format!("{character_type}{index}")
            } else {
                character.name.trim().to_string()
            };
            character.name = unique_name(&base_name, &taken);
            character.character_type = character_type.to_string();
            character.importance = Character::importance_for(character_type);
            taken.push(character.name.clone());
            characters.push(character);
        }

        Ok(json!({
            "characters": characters,
            "generation_info": {
                "character_type": character_type,
                "genre": genre,
                "requested": count,
                "generated": characters.len(),
            }
        }))
    }
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

    #[tokio::test]
    async fn creates_distinct_characters() {
        let model = ScriptedModel::new([
            r#"{"name": "林枫", "age": 18, "personality": ["坚毅"]}"#,
            r#"好的：{"name": "林枫", "age": "二十"}"#,
            r#"{"name": "", "gender": "女"}"#,
        ]);
        let tool = CharacterCreatorTool::new(assistant(model.clone()));

        let response = safe_execute(
            &tool,
            "c1",
            &params(json!({"character_type": "重要配角", "count": 3, "world_setting": {"world": {"name": "九州"}}})),
            &Map::new(),
        )
        .await;
        assert!(response.success, "{}", response.error_message());

        let characters = response.result["characters"].as_array().unwrap();
        let names: Vec<&str> = characters.iter().map(|c| c["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["林枫", "林枫2", "重要配角3"]);
        assert!(characters.iter().all(|c| c["importance"] == 8));
        assert_eq!(response.result["generation_info"]["generated"], 3);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("九州"));
        assert!(prompts[2].contains("林枫、林枫2"));
    }

    #[tokio::test]
    async fn unparseable_reply_fails_the_call() {
        let model = ScriptedModel::new(["我拒绝回答"]);
        let tool = CharacterCreatorTool::new(assistant(model));
        let response = safe_execute(&tool, "c2", &Map::new(), &Map::new()).await;
        assert!(!response.success);
        assert!(response.error_message().contains("JSON"));
    }

    #[tokio::test]
    async fn count_is_bounded() {
        let model = ScriptedModel::new(Vec::<String>::new());
        let tool = CharacterCreatorTool::new(assistant(model));
        let response = safe_execute(&tool, "c3", &params(json!({"count": 0})), &Map::new()).await;
        assert!(!response.success);
        assert!(response.error_message().contains("count"));
    }

    #[test]
    fn unique_names_get_counters() {
        let taken = vec!["苏雪".to_string(), "苏雪2".to_string()];
        assert_eq!(unique_name("苏雪", &taken), "苏雪3");
        assert_eq!(unique_name("叶凡", &taken), "叶凡");
    }
}
