use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use super::definition::Parameters;
use super::error::ToolError;

/// Shared, read-only values handed to every tool of one execution (run ids, session ids).
pub type ToolContext = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            parameters,
            timestamp: Utc::now(),
        }
    }

    /// Builds a call from a JSON value; anything other than an object yields empty parameters.
    pub fn from_value(name: impl Into<String>, parameters: Value) -> Self {
        let parameters = match parameters {
            Value::Object(map) => map,
            _ => Parameters::new(),
        };
        Self::new(name, parameters)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_secs", default)]
    pub execution_time: Duration,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ToolResponse {
    pub fn success(id: impl Into<String>, tool_name: &str, result: Value, elapsed: Duration) -> Self {
        Self {
            id: id.into(),
            success: true,
            result,
            error: None,
            execution_time: elapsed,
            metadata: tool_metadata(tool_name),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        id: impl Into<String>,
        tool_name: &str,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            execution_time: elapsed,
            metadata: tool_metadata(tool_name),
            timestamp: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.get("tool_name").and_then(Value::as_str)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// Converts the uniform record back into a `Result`, turning failures into `ToolError::Execution`.
    pub fn into_result(self) -> Result<Value, ToolError> {
        if self.success {
            Ok(self.result)
        } else {
            Err(ToolError::Execution(
                self.error.unwrap_or_else(|| "unknown tool failure".to_string()),
            ))
        }
    }
}

fn tool_metadata(tool_name: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("tool_name".to_string(), Value::String(tool_name.to_string()));
    metadata
}

/// Durations travel as fractional seconds.
pub(crate) mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !(secs.is_finite() && secs > 0.0) {
            return Ok(Duration::ZERO);
        }
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_are_unique() {
        let a = ToolCall::new("echo", Parameters::new());
        let b = ToolCall::new("echo", Parameters::new());
        assert_ne!(a.id, b.id);
        assert_eq!(ToolCall::from_value("echo", json!([1, 2])).parameters.len(), 0);
    }

    #[test]
    fn failure_response_serializes_elapsed_seconds() {
        let response =
            ToolResponse::failure("call-1", "echo", "boom", Duration::from_millis(1500));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], json!("call-1"));
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("boom"));
        assert_eq!(value["execution_time"], json!(1.5));
        assert_eq!(value["metadata"]["tool_name"], json!("echo"));

        let back: ToolResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back.execution_time, Duration::from_millis(1500));
        assert!(matches!(back.into_result(), Err(ToolError::Execution(msg)) if msg == "boom"));
    }

    #[test]
    fn out_of_range_elapsed_time_is_rejected() {
        let huge = serde_json::from_value::<ToolResponse>(
            json!({"id": "x", "success": true, "execution_time": 1e30}),
        );
        assert!(huge.is_err());

        let negative: ToolResponse = serde_json::from_value(
            json!({"id": "x", "success": true, "execution_time": -2.0}),
        )
        .unwrap();
        assert_eq!(negative.execution_time, Duration::ZERO);
    }
}
