//! Helpers for pulling structured data out of free-form model replies.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_-]*\s*\n?(.*?)```").unwrap());
static THINK_BLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static LATIN_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9]+").unwrap());

/// Strips reasoning blocks and a surrounding code fence, then trims.
pub fn clean_response(text: &str) -> String {
    let without_think = THINK_BLOCK_RE.replace_all(text, "");
    let trimmed = without_think.trim();
    if let Some(captures) = CODE_FENCE_RE.captures(trimmed) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str().trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Parses the span between the first `{` and the last `}`.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let cleaned = clean_response(text);
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&cleaned[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parses the span between the first `[` and the last `]`.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    let cleaned = clean_response(text);
    let start = cleaned.find('[')?;
    let end = cleaned.rfind(']')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&cleaned[start..=end]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Shallow merge: keys from `parsed` replace defaults unless they are null.
pub fn merge_defaults(defaults: Value, parsed: Map<String, Value>) -> Value {
    let mut merged = match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in parsed {
        if !value.is_null() {
            merged.insert(key, value);
        }
    }
    Value::Object(merged)
}

/// CJK ideographs count one each; runs of ASCII letters or digits count as one word.
pub fn count_words(text: &str) -> usize {
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let latin = LATIN_WORD_RE.find_iter(text).count();
    cjk + latin
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF | 0xF900..=0xFAFF)
}

/// Reads a string field, falling back to `default` for missing or non-string values.
pub fn str_field<'a>(map: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Turns `value` into a list of strings: arrays keep their string items,
/// strings are split on common separators.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(text)) => text
            .split(['、', '，', ',', ';', '；', '\n'])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_object_from_chatty_fenced_reply() {
        let reply = "好的，以下是设定：\n```json\n{\"name\": \"九州\", \"races\": [\"人族\"]}\n```\n希望有帮助";
        let map = extract_json_object(reply).unwrap();
        assert_eq!(map["name"], json!("九州"));
    }

    #[test]
    fn extracts_object_without_fence() {
        let reply = "<think>先想想</think>结果 {\"a\": {\"b\": 1}} 完毕";
        assert_eq!(extract_json_object(reply).unwrap()["a"]["b"], json!(1));
        assert!(extract_json_object("没有 JSON").is_none());
        assert!(extract_json_object("} 反了 {").is_none());
    }

    #[test]
    fn extracts_array() {
        let items = extract_json_array("角色：[{\"name\": \"林枫\"}, {\"name\": \"苏雪\"}]").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn merge_ignores_nulls() {
        let parsed = json!({"name": "青云", "era": null}).as_object().cloned().unwrap();
        let merged = merge_defaults(json!({"name": "默认", "era": "上古"}), parsed);
        assert_eq!(merged, json!({"name": "青云", "era": "上古"}));
    }

    #[test]
    fn counts_mixed_text() {
        assert_eq!(count_words("林枫拔剑"), 4);
        assert_eq!(count_words("Hello world，你好"), 4);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn string_lists_accept_arrays_and_delimited_text() {
        assert_eq!(string_list(Some(&json!(["a", " b ", ""]))), vec!["a", "b"]);
        assert_eq!(string_list(Some(&json!("剑、刀，枪"))), vec!["剑", "刀", "枪"]);
        assert!(string_list(None).is_empty());
    }
}
