use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use novel_core::novel::{
    register_novel_tools_with_cache, NovelStatus, PipelineStep, NOVEL_JSON, NOVEL_TEXT,
};
use novel_core::{
    Completion, CompletionRequest, GenerationRequest, LanguageModel, LanguageModelError,
    LlmService, LogLevel, NovelConfig, NovelGenerator, NovelStore, PipelineError, PromptLibrary,
    ToolRegistry, ToolsConfig, VecLogSink,
};
use tempfile::tempdir;

struct MockLanguageModel {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLanguageModel {
    fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn assert_empty(&self) {
        let guard = self.responses.lock().expect("mock mutex poisoned");
        assert!(
            guard.is_empty(),
            "expected all mock responses to be consumed"
        );
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock mutex poisoned").clone()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LanguageModelError> {
        self.prompts
            .lock()
            .expect("mock mutex poisoned")
            .push(request.last_user_message().to_string());
        let next = self.responses.lock().expect("mock mutex poisoned").pop_front();
        next.map(Completion::new)
            .ok_or_else(|| LanguageModelError::message("mock language model has no remaining responses"))
    }
}

fn tools_config() -> ToolsConfig {
    ToolsConfig {
        retry_attempts: 1,
        retry_delay_ms: 0,
        rate_limit_per_minute: 0,
        cache_results: false,
        cache_ttl_secs: 60,
    }
}

fn generator(model: Arc<MockLanguageModel>) -> NovelGenerator {
    let registry = Arc::new(ToolRegistry::new());
    register_novel_tools_with_cache(
        &registry,
        Arc::new(LlmService::new(model)),
        Arc::new(PromptLibrary::new().expect("built-in prompts parse")),
        &tools_config(),
        None,
    )
    .expect("novel tools register");
    NovelGenerator::new(registry)
}

fn request() -> GenerationRequest {
    let config = NovelConfig {
        default_chapter_count: 2,
        default_word_count: 800,
        supporting_characters: 1,
        ..NovelConfig::default()
    };
    let mut request = GenerationRequest::from_config("青云志", &config);
    request.genre = "仙侠".to_string();
    request
}

const WORLD: &str = r#"{"name": "九州", "type": "大陆", "major_races": ["人族", "妖族"]}"#;
const OUTLINE: &str = r#"```json
{
  "premise": "山村少年踏上求道之路",
  "central_conflict": "正邪两道争夺上古传承",
  "chapters": [
    {"number": 1, "title": "下山", "summary": "林枫离开山村"},
    {"number": 2, "title": "入门", "summary": "林枫拜入青云宗"}
  ]
}
```"#;

#[tokio::test]
async fn full_generation_pipeline_produces_expected_artifacts(
) -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(MockLanguageModel::new([
        WORLD,
        r#"{"name": "林枫", "personality": ["坚毅"]}"#,
        r#"{"name": "血煞老祖"}"#,
        r#"{"name": "苏雪"}"#,
        OUTLINE,
        "林枫背起行囊，走出了山村。",
        "林枫离开山村，踏上求道之路。",
        "青云宗山门巍峨。“来者何人？”",
        "林枫通过考验，拜入青云宗。",
    ]));
    let sink = Arc::new(VecLogSink::new());
    let store = NovelStore::new(temp.path());
    let generator = generator(model.clone())
        .with_log_sink(sink.clone())
        .with_store(store.clone());

    let novel = generator.generate(&request()).await?;
    model.assert_empty();

    assert_eq!(novel.status, NovelStatus::Completed);
    assert_eq!(novel.world.as_ref().map(|w| w.name.as_str()), Some("九州"));

    let types: Vec<&str> = novel.characters.iter().map(|c| c.character_type.as_str()).collect();
    assert_eq!(types, vec!["主角", "反派", "重要配角"]);
    let mut names: Vec<&str> = novel.characters.iter().map(|c| c.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["林枫", "苏雪", "血煞老祖"]);

    let outline = novel.outline.as_ref().expect("outline stored");
    assert_eq!(outline.chapters.len(), 2);
    assert_eq!(novel.chapters.len(), 2);
    assert_eq!(novel.chapters[1].title, "入门");
    assert!(novel.total_word_count() > 0);

    let prompts = model.prompts();
    assert!(prompts[0].contains("仙侠"));
    assert!(prompts[4].contains("九州"), "outline prompt carries the world");
    assert!(
        prompts[7].contains("林枫离开山村，踏上求道之路。"),
        "second chapter sees the first chapter's summary"
    );

    let dir = store.dir_for(&novel);
    assert!(dir.join(NOVEL_JSON).is_file());
    let text = std::fs::read_to_string(dir.join(NOVEL_TEXT))?;
    assert!(text.contains("山村少年踏上求道之路"));
    assert!(text.contains("第2章 入门"));
    assert_eq!(store.load(&dir)?, novel);

    let records = sink.records();
    assert!(records
        .iter()
        .any(|r| r.level == LogLevel::Info && r.message.contains("生成完成")));
    Ok(())
}

#[tokio::test]
async fn failing_step_is_named_and_partial_novel_is_saved() {
    let temp = tempdir().unwrap();
    let model = Arc::new(MockLanguageModel::new([
        WORLD,
        r#"{"name": "林枫"}"#,
        r#"{"name": "血煞老祖"}"#,
        r#"{"name": "苏雪"}"#,
        "这不是大纲",
    ]));
    let store = NovelStore::new(temp.path());
    let generator = generator(model.clone()).with_store(store.clone());

    let err = generator.generate(&request()).await.unwrap_err();
    assert_eq!(err.step(), Some(PipelineStep::Outline));
    assert!(matches!(err, PipelineError::Step { .. }));
    assert!(err.to_string().contains("outline"));

    let saved = store.load_title("青云志").unwrap();
    assert_eq!(saved.status, NovelStatus::Failed);
    assert_eq!(saved.characters.len(), 3);
    assert!(saved.chapters.is_empty());
}

#[tokio::test]
async fn chapter_writer_requires_story_planner() {
    let model = Arc::new(MockLanguageModel::new(Vec::<String>::new()));
    let generator = generator(model);
    let registry = generator.registry();
    assert!(registry.unregister("story_planner"));

    let response = registry
        .execute(
            "chapter",
            serde_json::json!({"chapter_info": {"number": 1}, "story_context": {}})
                .as_object()
                .cloned()
                .unwrap(),
            &Default::default(),
        )
        .await;
    assert!(!response.success);
    assert!(response.error_message().contains("story_planner"));
}
