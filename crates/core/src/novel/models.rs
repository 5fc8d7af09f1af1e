use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::parsing::string_list;

/// Deserializers that accept whatever shape a model happened to answer with.
mod lenient {
    use super::*;

    pub fn strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(string_list(Some(&value)))
    }

    pub fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => String::new(),
            Value::String(text) => text,
            Value::Array(items) => string_list(Some(&Value::Array(items))).join("、"),
            other => other.to_string(),
        })
    }

    pub fn number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(as_u32(&Value::deserialize(deserializer)?))
    }

    pub fn number_or_zero<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(as_u32(&Value::deserialize(deserializer)?).unwrap_or_default())
    }

    pub fn tension<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(as_u32(&Value::deserialize(deserializer)?)
            .map(|level| level.clamp(1, 10) as u8)
            .unwrap_or(5))
    }

    pub fn factions<'de, D>(deserializer: D) -> Result<Vec<Faction>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let items = match value {
            Value::Array(items) => items,
            other => return Ok(string_list(Some(&other)).into_iter().map(Faction::named).collect()),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(Faction::named(name)),
                Value::Object(_) => serde_json::from_value(item).ok(),
                _ => None,
            })
            .collect())
    }

    pub fn timeline<'de, D>(deserializer: D) -> Result<Vec<HistoryEvent>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(event) => Some(HistoryEvent {
                        period: String::new(),
                        event,
                    }),
                    Value::Object(_) => serde_json::from_value(item).ok(),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    pub fn plot_points<'de, D>(deserializer: D) -> Result<Vec<PlotPoint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        })
    }

    pub fn chapter_plans<'de, D>(deserializer: D) -> Result<Vec<ChapterPlan>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        })
    }

    fn as_u32(value: &Value) -> Option<u32> {
        match value {
            Value::Number(number) => number
                .as_u64()
                .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .and_then(|n| u32::try_from(n).ok()),
            Value::String(text) => text
                .trim()
                .trim_end_matches(['岁', '章'])
                .parse()
                .ok(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Faction {
    #[serde(default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub description: String,
}

impl Faction {
    fn named(name: String) -> Self {
        Self {
            name,
            description: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    #[serde(default, deserialize_with = "lenient::text")]
    pub period: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub event: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldSetting {
    #[serde(deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(rename = "type", deserialize_with = "lenient::text")]
    pub world_type: String,
    #[serde(deserialize_with = "lenient::text")]
    pub time_period: String,
    #[serde(deserialize_with = "lenient::text")]
    pub technology_level: String,
    #[serde(deserialize_with = "lenient::text")]
    pub magic_prevalence: String,
    #[serde(deserialize_with = "lenient::text")]
    pub political_system: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub major_races: Vec<String>,
    #[serde(deserialize_with = "lenient::factions")]
    pub major_kingdoms: Vec<Faction>,
    #[serde(deserialize_with = "lenient::strings")]
    pub natural_features: Vec<String>,
    #[serde(deserialize_with = "lenient::strings")]
    pub unique_elements: Vec<String>,
    #[serde(deserialize_with = "lenient::timeline")]
    pub history_timeline: Vec<HistoryEvent>,
    #[serde(deserialize_with = "lenient::text")]
    pub culture_notes: String,
    #[serde(deserialize_with = "lenient::text")]
    pub economy_system: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub languages: Vec<String>,
    /// Expanded write-ups keyed by area, only present for detailed worlds.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mysteries: Vec<Value>,
}

impl WorldSetting {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// One-paragraph digest used as prompt context.
    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "{}（{}）",
            non_empty(&self.name, "未命名世界"),
            non_empty(&self.world_type, "未知类型")
        )];
        if !self.time_period.is_empty() {
            parts.push(format!("时代：{}", self.time_period));
        }
        if !self.technology_level.is_empty() {
            parts.push(format!("科技：{}", self.technology_level));
        }
        if !self.magic_prevalence.is_empty() {
            parts.push(format!("超凡力量：{}", self.magic_prevalence));
        }
        if !self.political_system.is_empty() {
            parts.push(format!("政体：{}", self.political_system));
        }
        if !self.major_races.is_empty() {
            parts.push(format!("种族：{}", self.major_races.join("、")));
        }
        if !self.major_kingdoms.is_empty() {
            let names: Vec<&str> = self.major_kingdoms.iter().map(|k| k.name.as_str()).collect();
            parts.push(format!("势力：{}", names.join("、")));
        }
        if !self.unique_elements.is_empty() {
            parts.push(format!("特色：{}", self.unique_elements.join("、")));
        }
        parts.join("；")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Character {
    pub id: String,
    #[serde(deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(deserialize_with = "lenient::text")]
    pub nickname: String,
    #[serde(deserialize_with = "lenient::text")]
    pub gender: String,
    #[serde(deserialize_with = "lenient::number")]
    pub age: Option<u32>,
    #[serde(deserialize_with = "lenient::text")]
    pub appearance: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub personality: Vec<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub background: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub abilities: Vec<String>,
    #[serde(deserialize_with = "lenient::strings")]
    pub goals: Vec<String>,
    #[serde(deserialize_with = "lenient::strings")]
    pub secrets: Vec<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub story_role: String,
    #[serde(deserialize_with = "lenient::text")]
    pub character_arc: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub relationships: Vec<String>,
    pub character_type: String,
    pub importance: u8,
}

impl Default for Character {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: String::new(),
            nickname: String::new(),
            gender: String::new(),
            age: None,
            appearance: String::new(),
            personality: Vec::new(),
            background: String::new(),
            abilities: Vec::new(),
            goals: Vec::new(),
            secrets: Vec::new(),
            story_role: String::new(),
            character_arc: String::new(),
            relationships: Vec::new(),
            character_type: String::new(),
            importance: 5,
        }
    }
}

impl Character {
    /// Importance on a 1-10 scale derived from the character's role.
    pub fn importance_for(character_type: &str) -> u8 {
        match character_type {
            "主角" => 10,
            "反派" => 9,
            "重要配角" => 8,
            "导师" => 7,
            _ => 5,
        }
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "{}（{}）",
            non_empty(&self.name, "无名"),
            non_empty(&self.character_type, "角色")
        );
        if !self.personality.is_empty() {
            text.push_str(&format!("，性格{}", self.personality.join("、")));
        }
        if !self.goals.is_empty() {
            text.push_str(&format!("，目标：{}", self.goals.join("、")));
        }
        text
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChapterPlan {
    #[serde(deserialize_with = "lenient::number_or_zero")]
    pub number: u32,
    #[serde(deserialize_with = "lenient::text")]
    pub title: String,
    #[serde(deserialize_with = "lenient::text")]
    pub summary: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub key_events: Vec<String>,
    #[serde(deserialize_with = "lenient::strings")]
    pub character_focus: Vec<String>,
    #[serde(deserialize_with = "lenient::tension")]
    pub tension_level: u8,
    #[serde(deserialize_with = "lenient::text")]
    pub pacing: String,
    #[serde(deserialize_with = "lenient::text")]
    pub mood: String,
}

impl Default for ChapterPlan {
    fn default() -> Self {
        Self {
            number: 0,
            title: String::new(),
            summary: String::new(),
            key_events: Vec::new(),
            character_focus: Vec::new(),
            tension_level: 5,
            pacing: "medium".to_string(),
            mood: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlotPoint {
    #[serde(deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(deserialize_with = "lenient::number_or_zero")]
    pub chapter: u32,
    #[serde(deserialize_with = "lenient::text")]
    pub description: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoryOutline {
    #[serde(deserialize_with = "lenient::text")]
    pub title: String,
    #[serde(deserialize_with = "lenient::text")]
    pub structure: String,
    #[serde(deserialize_with = "lenient::text")]
    pub premise: String,
    #[serde(deserialize_with = "lenient::text")]
    pub protagonist: String,
    #[serde(deserialize_with = "lenient::text")]
    pub antagonist: String,
    #[serde(deserialize_with = "lenient::text")]
    pub central_conflict: String,
    #[serde(deserialize_with = "lenient::text")]
    pub beginning: String,
    #[serde(deserialize_with = "lenient::text")]
    pub middle: String,
    #[serde(deserialize_with = "lenient::text")]
    pub climax: String,
    #[serde(deserialize_with = "lenient::text")]
    pub resolution: String,
    #[serde(deserialize_with = "lenient::strings")]
    pub themes: Vec<String>,
    #[serde(deserialize_with = "lenient::strings")]
    pub subplots: Vec<String>,
    #[serde(deserialize_with = "lenient::plot_points")]
    pub plot_points: Vec<PlotPoint>,
    #[serde(deserialize_with = "lenient::chapter_plans")]
    pub chapters: Vec<ChapterPlan>,
}

impl StoryOutline {
    pub fn chapter(&self, number: u32) -> Option<&ChapterPlan> {
        self.chapters.iter().find(|plan| plan.number == number)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub content: String,
    pub word_count: usize,
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NovelStatus {
    #[default]
    Draft,
    Generating,
    Completed,
    Failed,
}

impl fmt::Display for NovelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NovelStatus::Draft => "草稿",
            NovelStatus::Generating => "生成中",
            NovelStatus::Completed => "已完成",
            NovelStatus::Failed => "失败",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Novel {
    pub id: String,
    pub title: String,
    pub genre: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub writing_style: String,
    #[serde(default)]
    pub status: NovelStatus,
    #[serde(default)]
    pub world: Option<WorldSetting>,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub outline: Option<StoryOutline>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Novel {
    pub fn new(title: impl Into<String>, genre: impl Into<String>, theme: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            genre: genre.into(),
            theme: theme.into(),
            writing_style: String::new(),
            status: NovelStatus::Draft,
            world: None,
            characters: Vec::new(),
            outline: None,
            chapters: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_word_count(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.word_count).sum()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn world_accepts_loose_shapes() {
        let world = WorldSetting::from_value(&json!({
            "name": "九州",
            "type": "大陆",
            "major_races": "人族、妖族",
            "major_kingdoms": ["青云宗", {"name": "大夏", "description": "人族王朝"}],
            "history_timeline": [{"period": "上古", "event": "天地初开"}, "神魔大战"],
            "languages": null,
            "unexpected": 42
        }));
        assert_eq!(world.major_races, vec!["人族", "妖族"]);
        assert_eq!(world.major_kingdoms.len(), 2);
        assert_eq!(world.major_kingdoms[1].description, "人族王朝");
        assert_eq!(world.history_timeline[1].event, "神魔大战");
        assert!(world.languages.is_empty());
        assert!(world.summary().starts_with("九州（大陆）"));
    }

    #[test]
    fn character_numbers_and_lists_are_forgiving() {
        let character: Character = serde_json::from_value(json!({
            "name": "林枫",
            "age": "十八",
            "personality": ["坚毅", "隐忍"],
            "goals": "复仇，守护家人"
        }))
        .unwrap();
        assert_eq!(character.age, None);
        assert_eq!(character.goals, vec!["复仇", "守护家人"]);
        assert!(!character.id.is_empty());

        let aged: Character = serde_json::from_value(json!({"age": "18岁"})).unwrap();
        assert_eq!(aged.age, Some(18));
    }

    #[test]
    fn chapter_plan_clamps_tension() {
        let plan: ChapterPlan =
            serde_json::from_value(json!({"number": "3", "tension_level": 42})).unwrap();
        assert_eq!(plan.number, 3);
        assert_eq!(plan.tension_level, 10);
        assert_eq!(plan.pacing, "medium");
    }

    #[test]
    fn novel_round_trips_through_json() {
        let mut novel = Novel::new("青云志", "玄幻", "成长");
        novel.chapters.push(Chapter {
            number: 1,
            title: "初入宗门".into(),
            content: "正文".into(),
            word_count: 2,
            summary: String::new(),
            created_at: Utc::now(),
        });
        let text = serde_json::to_string(&novel).unwrap();
        let back: Novel = serde_json::from_str(&text).unwrap();
        assert_eq!(back, novel);
        assert_eq!(back.total_word_count(), 2);
        assert_eq!(back.status.to_string(), "草稿");
    }
}
