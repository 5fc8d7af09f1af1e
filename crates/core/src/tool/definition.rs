use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::error::ToolError;

/// Parameter dictionary passed to every tool invocation.
pub type Parameters = Map<String, Value>;

fn default_required() -> bool {
    true
}

fn default_category() -> String {
    "general".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParameterType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().map(|n| n.fract() == 0.0).unwrap_or(false)
            }
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, kind: ParameterType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
            default: None,
            allowed: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Marks the parameter optional and records the value used when it is absent.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.required = false;
        self.default = Some(value.into());
        self
    }

    pub fn with_enum<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    fn check(&self, value: &Value) -> Result<(), ToolError> {
        if value.is_null() {
            return Ok(());
        }

        if !self.kind.accepts(value) {
            return Err(ToolError::InvalidParameter {
                name: self.name.clone(),
                reason: format!("expected {}, got {}", self.kind, json_kind(value)),
            });
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.iter().any(|candidate| candidate == value) {
                let options = allowed
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ToolError::InvalidParameter {
                    name: self.name.clone(),
                    reason: format!("value {value} is not one of [{options}]"),
                });
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExample {
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default)]
    pub examples: Vec<ToolExample>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: default_category(),
            version: default_version(),
            parameters: Vec::new(),
            examples: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn example(mut self, parameters: Parameters, result: Value) -> Self {
        self.examples.push(ToolExample { parameters, result });
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Tools whose name starts with `_` are left out of default listings.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('_')
    }

    pub fn get_parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ToolParameter> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// Case-insensitive substring match on name, description and tags.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
            || self
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&needle))
    }

    /// A required parameter given as `null` counts as missing, matching how
    /// `apply_defaults` treats `null` as absent.
    pub fn validate_parameters(&self, parameters: &Parameters) -> Result<(), ToolError> {
        let missing: Vec<String> = self
            .required_parameters()
            .filter(|p| parameters.get(&p.name).map_or(true, Value::is_null))
            .map(|p| p.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::MissingParameters(missing));
        }

        for parameter in &self.parameters {
            if let Some(value) = parameters.get(&parameter.name) {
                parameter.check(value)?;
            }
        }

        Ok(())
    }

    /// Returns a copy of `parameters` with declared defaults filled in for absent keys.
    pub fn apply_defaults(&self, parameters: &Parameters) -> Parameters {
        let mut prepared = parameters.clone();
        for parameter in &self.parameters {
            if let Some(default) = &parameter.default {
                let absent = prepared.get(&parameter.name).map_or(true, Value::is_null);
                if absent {
                    prepared.insert(parameter.name.clone(), default.clone());
                }
            }
        }
        prepared
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn planner() -> ToolDefinition {
        ToolDefinition::new("story_planner", "规划故事大纲")
            .with_category("plot")
            .parameter(ToolParameter::new("title", ParameterType::String, "标题"))
            .parameter(ToolParameter::new("genre", ParameterType::String, "类型"))
            .parameter(
                ToolParameter::new("chapter_count", ParameterType::Integer, "章节数")
                    .with_default(20),
            )
            .parameter(
                ToolParameter::new("structure", ParameterType::String, "结构")
                    .with_default("三幕式")
                    .with_enum(["三幕式", "英雄之旅"]),
            )
            .tag("outline")
    }

    #[test]
    fn reports_every_missing_required_parameter() {
        let err = planner()
            .validate_parameters(&Parameters::new())
            .expect_err("missing");
        match err {
            ToolError::MissingParameters(names) => {
                assert_eq!(names, vec!["title".to_string(), "genre".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn explicit_null_counts_as_missing() {
        let err = planner()
            .validate_parameters(&params(json!({"title": null, "genre": "仙侠"})))
            .expect_err("null title");
        assert!(matches!(err, ToolError::MissingParameters(ref names) if names == &["title".to_string()]));
    }

    #[test]
    fn rejects_wrong_type_and_unknown_enum_value() {
        let definition = planner();
        let err = definition
            .validate_parameters(&params(json!({"title": "t", "genre": "g", "chapter_count": "ten"})))
            .expect_err("type mismatch");
        assert!(matches!(err, ToolError::InvalidParameter { ref name, .. } if name == "chapter_count"));

        let err = definition
            .validate_parameters(&params(json!({"title": "t", "genre": "g", "structure": "五幕式"})))
            .expect_err("enum mismatch");
        assert!(matches!(err, ToolError::InvalidParameter { ref name, .. } if name == "structure"));
    }

    #[test]
    fn integral_floats_count_as_integers() {
        assert!(ParameterType::Integer.accepts(&json!(3.0)));
        assert!(!ParameterType::Integer.accepts(&json!(3.5)));
        assert!(ParameterType::Number.accepts(&json!(3.5)));
    }

    #[test]
    fn applies_defaults_without_overwriting() {
        let prepared = planner().apply_defaults(&params(json!({"title": "t", "chapter_count": 3})));
        assert_eq!(prepared["chapter_count"], json!(3));
        assert_eq!(prepared["structure"], json!("三幕式"));
        assert!(prepared.get("genre").is_none());
    }

    #[test]
    fn serializes_with_wire_names() {
        let value = serde_json::to_value(planner()).unwrap();
        assert_eq!(value["parameters"][0]["type"], json!("string"));
        assert_eq!(value["parameters"][3]["enum"], json!(["三幕式", "英雄之旅"]));

        let parsed: ToolDefinition =
            serde_json::from_value(json!({"name": "x", "parameters": [{"name": "a"}]})).unwrap();
        assert_eq!(parsed.category, "general");
        assert_eq!(parsed.version, "1.0.0");
        assert!(parsed.parameters[0].required);
    }

    #[test]
    fn matching_and_hidden_names() {
        let definition = planner();
        assert!(definition.matches("OUTLINE"));
        assert!(definition.matches("大纲"));
        assert!(!definition.matches("dragon"));
        assert!(ToolDefinition::new("_internal", "").is_hidden());
    }
}
