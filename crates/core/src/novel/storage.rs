use log::info;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::models::Novel;

pub const NOVEL_JSON: &str = "novel.json";
pub const NOVEL_TEXT: &str = "novel.txt";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize `{path}`: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Saves each novel under `<root>/<slug>/` as JSON plus a readable text export.
#[derive(Clone, Debug)]
pub struct NovelStore {
    root: PathBuf,
}

impl NovelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, novel: &Novel) -> PathBuf {
        let slug = slugify(&novel.title);
        if slug.is_empty() {
            self.root.join(&novel.id)
        } else {
            self.root.join(slug)
        }
    }

    /// Returns the directory the novel was written to.
    pub fn save(&self, novel: &Novel) -> Result<PathBuf, StorageError> {
        let dir = self.dir_for(novel);
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;

        let json_path = dir.join(NOVEL_JSON);
        let json = serde_json::to_string_pretty(novel).map_err(|source| StorageError::Json {
            path: json_path.clone(),
            source,
        })?;
        write(&json_path, &json)?;
        write(&dir.join(NOVEL_TEXT), &render_text(novel))?;

        info!("小说《{}》已保存到 {}", novel.title, dir.display());
        Ok(dir)
    }

    /// Accepts a novel directory or a path to its `novel.json`.
    pub fn load(&self, path: &Path) -> Result<Novel, StorageError> {
        let json_path = if path.is_dir() {
            path.join(NOVEL_JSON)
        } else {
            path.to_path_buf()
        };
        let data = fs::read_to_string(&json_path).map_err(|source| StorageError::Io {
            path: json_path.clone(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| StorageError::Json {
            path: json_path,
            source,
        })
    }

    pub fn load_title(&self, title: &str) -> Result<Novel, StorageError> {
        self.load(&self.root.join(slugify(title)))
    }

    /// Directories under the root that hold a saved novel, sorted by name.
    pub fn list(&self) -> Result<Vec<PathBuf>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.join(NOVEL_JSON).is_file())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

fn write(path: &Path, contents: &str) -> Result<(), StorageError> {
    fs::write(path, contents).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Keeps letters and digits of any script; everything else collapses to `_`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.trim().chars() {
        if ch.is_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// Plain-text export: title page, info, synopsis, world, characters, outline, chapters.
pub fn render_text(novel: &Novel) -> String {
    const RULE: &str = "==================================================";
    let mut out = String::new();

    let _ = writeln!(out, "《{}》\n", novel.title);
    let _ = writeln!(out, "{RULE}\n作品信息\n{RULE}");
    let _ = writeln!(out, "类型：{}", novel.genre);
    if !novel.theme.is_empty() {
        let _ = writeln!(out, "主题：{}", novel.theme);
    }
    let _ = writeln!(out, "状态：{}", novel.status);
    let _ = writeln!(out, "章节数：{}", novel.chapters.len());
    let _ = writeln!(out, "总字数：{}", novel.total_word_count());
    let _ = writeln!(out, "创建时间：{}\n", novel.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(outline) = novel.outline.as_ref().filter(|o| !o.premise.is_empty()) {
        let _ = writeln!(out, "{RULE}\n故事梗概\n{RULE}");
        let _ = writeln!(out, "{}\n", outline.premise);
        if !outline.central_conflict.is_empty() {
            let _ = writeln!(out, "核心冲突：{}\n", outline.central_conflict);
        }
    }

    if let Some(world) = &novel.world {
        let _ = writeln!(out, "{RULE}\n世界设定\n{RULE}");
        let _ = writeln!(out, "{}\n", world.summary());
        for (area, detail) in &world.details {
            let _ = writeln!(out, "[{area}] {detail}\n");
        }
    }

    if !novel.characters.is_empty() {
        let _ = writeln!(out, "{RULE}\n主要角色\n{RULE}");
        for character in &novel.characters {
            let _ = writeln!(out, "{}（{}）", character.name, character.character_type);
            if !character.background.is_empty() {
                let _ = writeln!(out, "  背景：{}", character.background);
            }
            if !character.personality.is_empty() {
                let _ = writeln!(out, "  性格：{}", character.personality.join("、"));
            }
        }
        out.push('\n');
    }

    if let Some(outline) = novel.outline.as_ref().filter(|o| !o.chapters.is_empty()) {
        let _ = writeln!(out, "{RULE}\n章节大纲\n{RULE}");
        for plan in &outline.chapters {
            let _ = writeln!(out, "第{}章 {}：{}", plan.number, plan.title, plan.summary);
        }
        out.push('\n');
    }

    for chapter in &novel.chapters {
        let _ = writeln!(out, "{RULE}\n第{}章 {}\n{RULE}\n", chapter.number, chapter.title);
        let _ = writeln!(out, "{}\n", chapter.content.trim());
    }

    out
}
