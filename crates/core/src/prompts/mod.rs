use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptSource {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::BuiltIn)
    }
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    template: String,
    system: Option<String>,
    description: Option<String>,
    segments: Vec<TemplateSegment>,
    required: BTreeSet<String>,
    source: PromptSource,
}

impl PromptTemplate {
    /// Parses an ad-hoc template; every placeholder is required.
    pub fn parse(key: impl Into<String>, template: impl Into<String>) -> Self {
        let template = template.into();
        let (segments, placeholders) = parse_template(&template);
        Self {
            key: key.into(),
            template,
            system: None,
            description: None,
            segments,
            required: placeholders,
            source: PromptSource::BuiltIn,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// System message to send along with the rendered prompt.
    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(|s| s.as_str())
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self.required.iter().find(|r| !arguments.contains_key(*r)) {
            return Err(PromptError::MissingArgument {
                key: self.key.clone(),
                argument: missing.clone(),
            });
        }

        let mut output = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => output.push_str(text),
                TemplateSegment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }

        Ok(output.trim().to_string())
    }

    pub fn render_with<I, K, V>(&self, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.render(&collect_arguments(arguments))
    }

    fn from_raw(key: String, raw: RawPrompt, source: PromptSource) -> Result<Self, PromptError> {
        let (segments, placeholders) = parse_template(&raw.template);
        let required = if raw.required.is_empty() {
            placeholders
        } else {
            let mut set = BTreeSet::new();
            for argument in raw.required {
                let trimmed = argument.trim().to_string();
                if !placeholders.contains(&trimmed) {
                    return Err(PromptError::InvalidRequired {
                        key: key.clone(),
                        argument: trimmed,
                    });
                }
                set.insert(trimmed);
            }
            set
        };

        Ok(Self {
            key,
            template: raw.template,
            system: raw.system.filter(|s| !s.trim().is_empty()),
            description: raw.description,
            segments,
            required,
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown prompt template `{0}`")]
    NotFound(String),
    #[error("template `{key}` needs argument `{argument}`")]
    MissingArgument { key: String, argument: String },
    #[error("cannot read prompts from `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("built-in prompt table is malformed: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("prompt table `{path}` is not valid TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("prompt table `{path}` is not valid YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("template `{key}` lists `{argument}` as required but never uses it")]
    InvalidRequired { key: String, argument: String },
}

/// Templates keyed `section.name`. Files in custom directories override
/// built-ins with the same key; later files win.
#[derive(Debug)]
pub struct PromptLibrary {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptLibrary {
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<PathBuf>(&[])
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::with_custom_directories(&config.custom_directories)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut library = Self {
            prompts: BTreeMap::new(),
            directories: directories
                .iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
        };
        library.reload()?;
        Ok(library)
    }

    pub fn custom_directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();
        let document: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_document(&mut prompts, document, PromptSource::BuiltIn)?;

        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }

        debug!("已加载 {} 个提示词模板", prompts.len());
        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn template(&self, section: &str, name: &str) -> Result<&PromptTemplate, PromptError> {
        let key = format!("{section}.{name}");
        self.prompts.get(&key).ok_or(PromptError::NotFound(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prompts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(|k| k.as_str())
    }

    pub fn render<I, K, V>(&self, section: &str, name: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.template(section, name)?.render_with(arguments)
    }
}

fn collect_arguments<I, K, V>(arguments: I) -> PromptArguments
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    arguments
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

fn insert_document(
    prompts: &mut BTreeMap<String, PromptTemplate>,
    document: PromptDocument,
    source: PromptSource,
) -> Result<(), PromptError> {
    for (section, templates) in document {
        for (name, raw) in templates {
            let key = format!("{section}.{name}");
            let template = PromptTemplate::from_raw(key.clone(), raw, source.clone())?;
            prompts.insert(key, template);
        }
    }
    Ok(())
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PromptError::Io { path, source }
    };

    let mut files = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(dir))?;
    files.retain(|path| path.is_file() && prompt_format(path).is_some());
    files.sort();

    for path in files {
        let contents = fs::read_to_string(&path).map_err(io_error(&path))?;
        let document: PromptDocument = match prompt_format(&path) {
            Some(PromptFormat::Toml) => {
                toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
                    path: path.clone(),
                    source,
                })?
            }
            _ => serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
                path: path.clone(),
                source,
            })?,
        };
        debug!("加载自定义提示词: {}", path.display());
        insert_document(prompts, document, PromptSource::File(path))?;
    }

    Ok(())
}

enum PromptFormat {
    Toml,
    Yaml,
}

fn prompt_format(path: &Path) -> Option<PromptFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Some(PromptFormat::Toml),
        "yaml" | "yml" => Some(PromptFormat::Yaml),
        _ => None,
    }
}

type PromptDocument = BTreeMap<String, BTreeMap<String, RawPrompt>>;

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Clone, Debug)]
enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

/// Splits a template into literal text and `{name}` placeholders.
/// `{{` and `}}` are literal braces; a brace pair without a name, or an
/// opening brace that is never closed, is kept as text.
fn parse_template(template: &str) -> (Vec<TemplateSegment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find(|c| c == '{' || c == '}') {
        literal.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            literal.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            literal.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find('}') {
            Some(close) if !tail[1..=close].trim().is_empty() => {
                let name = tail[1..=close].trim().to_string();
                if !literal.is_empty() {
                    segments.push(TemplateSegment::Literal(std::mem::take(&mut literal)));
                }
                placeholders.insert(name.clone());
                segments.push(TemplateSegment::Placeholder(name));
                rest = &tail[close + 2..];
            }
            Some(close) => {
                literal.push_str(&tail[..close + 2]);
                rest = &tail[close + 2..];
            }
            None => {
                literal.push_str(tail);
                rest = "";
            }
        }
    }
    literal.push_str(rest);

    if !literal.is_empty() {
        segments.push(TemplateSegment::Literal(literal));
    }
    (segments, placeholders)
}
