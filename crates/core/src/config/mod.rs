use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "NOVEL_";
const ENV_SEPARATOR: &str = "__";

fn default_app_name() -> String {
    "Novel Generator".to_string()
}

fn default_version() -> String {
    "2.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model_name() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_timeout() -> u64 {
    60
}

fn default_retry_times() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_chapter_count() -> u32 {
    20
}

fn default_word_count() -> u32 {
    2000
}

fn default_max_characters() -> u32 {
    50
}

fn default_supporting_characters() -> u32 {
    2
}

fn default_genre() -> String {
    "玄幻".to_string()
}

fn default_writing_style() -> String {
    "traditional".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

fn default_tool_retry_attempts() -> usize {
    3
}

fn default_tool_retry_delay_ms() -> u64 {
    1000
}

fn default_rate_limit() -> u32 {
    60
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse JSON config `{path}`: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse YAML config `{path}`: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to read env file `{path}`: {source}")]
    Env {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("failed to serialize YAML config: {0}")]
    SerializeYaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retry_times")]
    pub retry_times: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_name: default_model_name(),
            api_key: String::new(),
            api_base: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout: default_timeout(),
            retry_times: default_retry_times(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl LlmConfig {
    /// Local providers accept requests without an API key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(
            self.provider.trim().to_lowercase().as_str(),
            "ollama" | "lmstudio" | "lm studio" | "ml studio"
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NovelConfig {
    #[serde(default = "default_genre")]
    pub default_genre: String,
    #[serde(default = "default_chapter_count")]
    pub default_chapter_count: u32,
    #[serde(default = "default_word_count")]
    pub default_word_count: u32,
    #[serde(default = "default_max_characters")]
    pub max_characters: u32,
    #[serde(default = "default_supporting_characters")]
    pub supporting_characters: u32,
    #[serde(default = "default_writing_style")]
    pub writing_style: String,
    #[serde(default = "default_true")]
    pub enable_diversity: bool,
    #[serde(default = "default_true")]
    pub auto_save: bool,
}

impl Default for NovelConfig {
    fn default() -> Self {
        Self {
            default_genre: default_genre(),
            default_chapter_count: default_chapter_count(),
            default_word_count: default_word_count(),
            max_characters: default_max_characters(),
            supporting_characters: default_supporting_characters(),
            writing_style: default_writing_style(),
            enable_diversity: true,
            auto_save: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_tool_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// `0` disables rate limiting.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_true")]
    pub cache_results: bool,
    #[serde(default = "default_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_tool_retry_attempts(),
            retry_delay_ms: default_tool_retry_delay_ms(),
            rate_limit_per_minute: default_rate_limit(),
            cache_results: true,
            cache_ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub novel: NovelConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            version: default_version(),
            debug: false,
            log_level: default_log_level(),
            output_dir: default_output_dir(),
            llm: LlmConfig::default(),
            novel: NovelConfig::default(),
            cache: CacheConfig::default(),
            tools: ToolsConfig::default(),
            prompts: PromptConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Reads a single JSON or YAML file, chosen by extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_value(read_file(path)?)
    }

    /// Writes YAML for `.yaml`/`.yml` paths, pretty JSON otherwise.
    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let serialized = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        fs::write(path, serialized).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Human-readable problems that would make generation fail or misbehave.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.llm.model_name.trim().is_empty() {
            problems.push("llm.model_name 不能为空".to_string());
        }
        if self.llm.requires_api_key() && self.llm.api_key.trim().is_empty() {
            problems.push(format!(
                "llm.api_key 未配置（provider: {}），可通过 {}LLM__API_KEY 设置",
                self.llm.provider, ENV_PREFIX
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            problems.push(format!(
                "llm.temperature 应在 0.0 到 2.0 之间，当前为 {}",
                self.llm.temperature
            ));
        }
        if self.llm.max_tokens == 0 {
            problems.push("llm.max_tokens 必须大于 0".to_string());
        }
        if self.novel.default_chapter_count == 0 {
            problems.push("novel.default_chapter_count 必须大于 0".to_string());
        }
        if self.novel.default_word_count == 0 {
            problems.push("novel.default_word_count 必须大于 0".to_string());
        }
        if self.novel.supporting_characters + 2 > self.novel.max_characters {
            problems.push(format!(
                "novel.supporting_characters 过多，角色总数不能超过 {}",
                self.novel.max_characters
            ));
        }
        if self.tools.retry_attempts == 0 {
            problems.push("tools.retry_attempts 必须至少为 1".to_string());
        }
        problems
    }
}

/// Builds [`AppSettings`] from `<name>.yaml`, `<name>.yml`, `<name>.json`,
/// the directory's `.env` file and the process environment, later layers
/// overriding earlier ones.
#[derive(Clone, Debug)]
pub struct ConfigLoader {
    dir: PathBuf,
    env_file: Option<PathBuf>,
    env_vars: Option<Vec<(String, String)>>,
}

impl ConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            env_file: Some(dir.join(".env")),
            dir,
            env_vars: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn with_env_file(mut self, path: Option<PathBuf>) -> Self {
        self.env_file = path;
        self
    }

    /// Replaces the process environment with a fixed set of variables.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn load(&self, name: &str) -> Result<AppSettings, ConfigError> {
        let merged = self.load_value(name)?;
        let settings = AppSettings::from_value(merged)?;
        info!(
            "配置加载完成: {} v{} (LLM: {}/{})",
            settings.app_name, settings.version, settings.llm.provider, settings.llm.model_name
        );
        Ok(settings)
    }

    pub fn load_value(&self, name: &str) -> Result<Value, ConfigError> {
        let mut merged = Value::Object(Map::new());

        for ext in ["yaml", "yml", "json"] {
            let path = self.dir.join(format!("{name}.{ext}"));
            if path.is_file() {
                debug!("加载配置文件: {}", path.display());
                deep_merge(&mut merged, read_file(&path)?);
            }
        }

        if let Some(env_file) = self.env_file.as_deref().filter(|p| p.is_file()) {
            debug!("加载环境变量文件: {}", env_file.display());
            let iter = dotenvy::from_path_iter(env_file).map_err(|source| ConfigError::Env {
                path: env_file.to_path_buf(),
                source,
            })?;
            for item in iter {
                let (key, raw) = item.map_err(|source| ConfigError::Env {
                    path: env_file.to_path_buf(),
                    source,
                })?;
                apply_env(&mut merged, &key, &raw);
            }
        }

        match &self.env_vars {
            Some(vars) => {
                for (key, raw) in vars {
                    apply_env(&mut merged, key, raw);
                }
            }
            None => {
                for (key, raw) in std::env::vars() {
                    apply_env(&mut merged, &key, &raw);
                }
            }
        }

        Ok(merged)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("yaml") | Some("yml")
    )
}

fn read_file(path: &Path) -> Result<Value, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if data.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    if is_yaml(path) {
        serde_yaml::from_str(&data).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_json::from_str(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Objects merge key by key; any other overlay value replaces the base.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Applies `NOVEL_SECTION__FIELD=value` to the matching nested key.
fn apply_env(target: &mut Value, key: &str, raw: &str) {
    let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
        return;
    };
    let path: Vec<String> = stripped
        .split(ENV_SEPARATOR)
        .map(|segment| segment.trim().to_lowercase())
        .filter(|segment| !segment.is_empty())
        .collect();
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut cursor = target;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.clone(), parse_env_value(raw));
    }
}

fn parse_env_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_))) => {
            value
        }
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new(dir).with_env_vars(Vec::<(String, String)>::new())
    }

    #[test]
    fn defaults_when_nothing_is_configured() {
        let temp = tempdir().unwrap();
        let settings = loader(temp.path()).load("config").unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.llm.max_tokens, 2000);
        assert_eq!(settings.novel.default_chapter_count, 20);
        assert_eq!(settings.cache.default_ttl_secs, 3600);
    }

    #[test]
    fn layers_merge_in_order() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("config.yaml"),
            "debug: true\nllm:\n  provider: deepseek\n  model_name: deepseek-chat\n  temperature: 0.9\n",
        )
        .unwrap();
        fs::write(
            temp.path().join("config.json"),
            r#"{"llm": {"model_name": "deepseek-reasoner"}, "novel": {"default_chapter_count": 12}}"#,
        )
        .unwrap();
        fs::write(
            temp.path().join(".env"),
            "NOVEL_LLM__API_KEY=sk-from-dotenv\nNOVEL_NOVEL__DEFAULT_WORD_COUNT=1500\nOTHER=ignored\n",
        )
        .unwrap();

        let settings = ConfigLoader::new(temp.path())
            .with_env_vars([("NOVEL_LLM__API_KEY", "sk-from-env"), ("NOVEL_DEBUG", "false")])
            .load("config")
            .unwrap();

        assert_eq!(settings.llm.provider, "deepseek");
        assert_eq!(settings.llm.model_name, "deepseek-reasoner");
        assert!((settings.llm.temperature - 0.9).abs() < f32::EPSILON);
        assert_eq!(settings.llm.api_key, "sk-from-env");
        assert_eq!(settings.novel.default_chapter_count, 12);
        assert_eq!(settings.novel.default_word_count, 1500);
        assert!(!settings.debug);
    }

    #[test]
    fn env_values_keep_non_json_text_as_strings() {
        let mut value = json!({});
        apply_env(&mut value, "NOVEL_LLM__API_BASE", "http://localhost:8000/v1");
        apply_env(&mut value, "NOVEL_TOOLS__RATE_LIMIT_PER_MINUTE", "0");
        apply_env(&mut value, "UNRELATED", "1");
        assert_eq!(
            value,
            json!({"llm": {"api_base": "http://localhost:8000/v1"}, "tools": {"rate_limit_per_minute": 0}})
        );
        assert_eq!(parse_env_value("null"), json!("null"));
    }

    #[test]
    fn invalid_json_reports_path() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("config.json"), "{ not json").unwrap();
        let err = loader(temp.path()).load("config").expect_err("parse error");
        assert!(matches!(err, ConfigError::Json { .. }));
    }

    #[test]
    fn save_and_reload_yaml_and_json() {
        let temp = tempdir().unwrap();
        let mut settings = AppSettings::default();
        settings.llm.api_key = "sk-test".into();
        settings.prompts.custom_directories = vec![PathBuf::from("prompts")];

        for name in ["nested/settings.yaml", "settings.json"] {
            let path = temp.path().join(name);
            settings.to_path(&path).unwrap();
            assert_eq!(AppSettings::from_path(&path).unwrap(), settings);
        }
    }

    #[test]
    fn validate_reports_missing_key_and_bad_numbers() {
        let mut settings = AppSettings::default();
        settings.novel.default_chapter_count = 0;
        let problems = settings.validate();
        assert!(problems.iter().any(|p| p.contains("api_key")));
        assert!(problems.iter().any(|p| p.contains("default_chapter_count")));

        settings.llm.provider = "ollama".into();
        settings.novel.default_chapter_count = 3;
        assert!(settings.validate().is_empty());
    }
}
