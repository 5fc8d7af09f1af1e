use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use novel_adapters::{create_language_model, AdapterError};
use novel_core::cache;
use novel_core::logging;
use novel_core::novel::register_novel_tools_with_cache;
use novel_core::{
    AppSettings, CompletionRequest, Completion, ConfigError, ConfigLoader, FileLogSink,
    GenerationRequest, LanguageModel, LanguageModelError, LlmService, LogLevel, LogRecord,
    LogSink, NovelStore, PipelineError, PromptError, PromptLibrary, SharedLogSink, StdoutLogSink,
    TeeLogSink, ToolContext, ToolError, ToolRegistry,
};
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const CONFIG_NAME: &str = "config";
const LOG_FILE_NAME: &str = "novelctl.log";
const TEST_PROMPT: &str = "Please reply 'OK'";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = ConfigLoader::new(&cli.config_dir).load(CONFIG_NAME)?;
    let sink = install_logging(&settings, cli.verbose)?;

    match cli.command {
        Command::Tools(command) => handle_tools(&settings, command, sink.as_ref()).await,
        Command::Generate(args) => run_generate(&settings, args, sink).await,
        Command::Config(command) => handle_config(&settings, command, sink.as_ref()).await,
        Command::Cache(command) => handle_cache(&settings, command),
    }
}

/// Console output always; a log file under the output directory in debug mode.
fn install_logging(settings: &AppSettings, verbose: bool) -> Result<SharedLogSink, CliError> {
    let level = if verbose || settings.debug {
        LogLevel::Debug
    } else {
        settings.log_level.parse().unwrap_or(LogLevel::Info)
    };

    let mut tee = TeeLogSink::new(vec![Arc::new(StdoutLogSink::new()) as SharedLogSink]);
    if settings.debug {
        let path = settings.output_dir.join(LOG_FILE_NAME);
        let file = FileLogSink::open(&path).map_err(|source| CliError::Io { path, source })?;
        tee.push(Arc::new(file));
    }

    let sink: SharedLogSink = Arc::new(tee);
    logging::init(sink.clone(), level)?;
    Ok(sink)
}

async fn handle_tools(
    settings: &AppSettings,
    command: ToolsCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ToolsCommand::List(args) => {
            let registry = build_registry(settings, offline_model(settings))?;
            let names = registry.list_tools(args.category.as_deref(), args.all);
            if names.is_empty() {
                println!("没有找到匹配的工具。");
            }
            for name in names {
                print_tool(&registry, &name);
            }
            Ok(())
        }
        ToolsCommand::Search(args) => {
            let registry = build_registry(settings, offline_model(settings))?;
            let names = registry.search_tools(&args.query);
            println!("搜索 `{}`：找到 {} 个工具", args.query, names.len());
            for name in names {
                print_tool(&registry, &name);
            }
            Ok(())
        }
        ToolsCommand::Run(args) => run_tool(settings, args, sink).await,
        ToolsCommand::Validate => {
            let registry = build_registry(settings, offline_model(settings))?;
            let problems = registry.validate_all_tools();
            if problems.is_empty() {
                sink.log(LogRecord::new(
                    LogLevel::Info,
                    format!("✅ {} 个工具定义全部有效", registry.len()),
                ));
                return Ok(());
            }
            let mut lines = Vec::new();
            for (name, issues) in problems {
                for issue in issues {
                    lines.push(format!("{name}: {issue}"));
                }
            }
            Err(CliError::Invalid(lines))
        }
    }
}

fn print_tool(registry: &ToolRegistry, name: &str) {
    let Some(tool) = registry.get_tool(name) else {
        return;
    };
    let definition = tool.definition();
    let aliases = registry.aliases_of(name);
    let aliases = if aliases.is_empty() {
        String::new()
    } else {
        format!(" (别名: {})", aliases.join(", "))
    };
    println!(
        "{:<20} [{}] {}{}",
        definition.name, definition.category, definition.description, aliases
    );
}

async fn run_tool(settings: &AppSettings, args: ToolRunArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let parameters = match serde_json::from_str::<Value>(&args.params)
        .map_err(CliError::InvalidParams)?
    {
        Value::Object(map) => map,
        _ => return Err(CliError::ParamsNotObject),
    };

    let registry = build_registry(settings, create_language_model(&settings.llm)?)?;
    sink.log(LogRecord::new(LogLevel::Info, format!("执行工具：{}", args.name)));

    let response = registry
        .execute(&args.name, parameters, &ToolContext::new())
        .await;
    println!(
        "{}",
        serde_json::to_string_pretty(&response).map_err(CliError::InvalidParams)?
    );

    if response.success {
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!("工具执行完成，耗时 {:.2}s", response.execution_time.as_secs_f64()),
        ));
        Ok(())
    } else {
        Err(CliError::ToolFailed {
            name: args.name,
            message: response.error_message().to_string(),
        })
    }
}

async fn run_generate(
    settings: &AppSettings,
    args: GenerateArgs,
    sink: SharedLogSink,
) -> Result<(), CliError> {
    let mut request = GenerationRequest::from_config(args.title.trim(), &settings.novel);
    if request.title.is_empty() {
        return Err(CliError::MissingTitle);
    }
    if let Some(genre) = args.genre {
        request.genre = genre;
    }
    if let Some(theme) = args.theme {
        request.theme = theme;
    }
    if let Some(chapters) = args.chapters {
        request.chapter_count = chapters;
    }
    if let Some(words) = args.words {
        request.words_per_chapter = words;
    }
    if let Some(style) = args.style {
        request.writing_style = style;
    }
    if request.chapter_count == 0 {
        return Err(CliError::ZeroChapters);
    }

    let model = create_language_model(&settings.llm)?;
    let registry = Arc::new(build_registry(settings, model)?);

    let mut generator = novel_core::NovelGenerator::new(registry).with_log_sink(sink.clone());
    let output_dir = args.output.unwrap_or_else(|| settings.output_dir.clone());
    if settings.novel.auto_save {
        generator = generator.with_store(NovelStore::new(&output_dir));
    }

    let sweeper = settings.cache.enabled.then(|| {
        cache::global().spawn_sweeper(Duration::from_secs(settings.cache.cleanup_interval_secs))
    });

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "使用模型：{} / {}，输出目录：{}",
            settings.llm.provider,
            settings.llm.model_name,
            output_dir.display()
        ),
    ));
    let result = generator.generate(&request).await;
    if let Some(handle) = sweeper {
        handle.abort();
    }
    let novel = result?;

    println!(
        "《{}》生成完成：{} 章，共 {} 字",
        novel.title,
        novel.chapters.len(),
        novel.total_word_count()
    );
    if settings.novel.auto_save {
        println!("已保存至：{}", NovelStore::new(&output_dir).dir_for(&novel).display());
    }
    Ok(())
}

async fn handle_config(
    settings: &AppSettings,
    command: ConfigCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::Show => {
            let mut shown = settings.clone();
            shown.llm.api_key = mask_secret(&shown.llm.api_key);
            println!(
                "{}",
                serde_json::to_string_pretty(&shown).map_err(CliError::InvalidParams)?
            );
            Ok(())
        }
        ConfigCommand::Check => {
            let problems = settings.validate();
            if problems.is_empty() {
                sink.log(LogRecord::new(LogLevel::Info, "✅ 配置检查通过".to_string()));
                Ok(())
            } else {
                Err(CliError::Invalid(problems))
            }
        }
        ConfigCommand::TestLlm => run_test_llm(settings, sink).await,
    }
}

async fn run_test_llm(settings: &AppSettings, sink: &dyn LogSink) -> Result<(), CliError> {
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "开始测试 LLM 配置：{} / {}",
            settings.llm.provider, settings.llm.model_name
        ),
    ));
    let model = create_language_model(&settings.llm)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("发送测试提示词: {TEST_PROMPT}"),
    ));

    match model.complete(CompletionRequest::from_prompt(TEST_PROMPT)).await {
        Ok(completion) if completion.content.trim().is_empty() => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                "❌ LLM配置测试失败：未获取到响应".to_string(),
            ));
            Err(CliError::TestFailed(
                "LLM配置测试失败：未获取到响应".to_string(),
            ))
        }
        Ok(completion) => {
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!(
                    "✅ LLM配置测试成功！耗时 {:.2}s",
                    completion.elapsed.as_secs_f64()
                ),
            ));
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("测试回复: {}", completion.content),
            ));
            Ok(())
        }
        Err(err) => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("❌ LLM配置测试出错: {err}"),
            ));
            Err(CliError::Model(err))
        }
    }
}

fn handle_cache(settings: &AppSettings, command: CacheCommand) -> Result<(), CliError> {
    match command {
        CacheCommand::Stats => {
            let stats = cache::global().stats();
            let report = serde_json::json!({
                "enabled": settings.cache.enabled,
                "default_ttl_secs": settings.cache.default_ttl_secs,
                "cleanup_interval_secs": settings.cache.cleanup_interval_secs,
                "stats": stats,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&report).map_err(CliError::InvalidParams)?
            );
            Ok(())
        }
    }
}

fn build_registry(
    settings: &AppSettings,
    model: Arc<dyn LanguageModel>,
) -> Result<ToolRegistry, CliError> {
    let prompts = PromptLibrary::from_prompt_config(&settings.prompts)?;
    let registry = ToolRegistry::new();
    let cache = (settings.cache.enabled && settings.tools.cache_results).then(cache::global);
    register_novel_tools_with_cache(
        &registry,
        Arc::new(LlmService::new(model)),
        Arc::new(prompts),
        &settings.tools,
        cache,
    )?;
    Ok(registry)
}

/// Listing and validating tools must work without credentials.
fn offline_model(settings: &AppSettings) -> Arc<dyn LanguageModel> {
    match create_language_model(&settings.llm) {
        Ok(model) => model,
        Err(err) => Arc::new(UnavailableModel(err.to_string())),
    }
}

struct UnavailableModel(String);

#[async_trait]
impl LanguageModel for UnavailableModel {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LanguageModelError> {
        Err(LanguageModelError::message(format!(
            "language model unavailable: {}",
            self.0
        )))
    }
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        String::new()
    } else if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] ConfigError),
    #[error("日志初始化失败: {0}")]
    Logger(#[from] log::SetLoggerError),
    #[error("写入文件 `{path}` 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("适配器调用失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("LLM 调用失败: {0}")]
    Model(#[from] LanguageModelError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("工具注册失败: {0}")]
    Tool(#[from] ToolError),
    #[error("小说生成失败: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("参数不是合法的 JSON: {0}")]
    InvalidParams(serde_json::Error),
    #[error("参数必须是 JSON 对象")]
    ParamsNotObject,
    #[error("工具 `{name}` 执行失败: {message}")]
    ToolFailed { name: String, message: String },
    #[error("小说标题不能为空")]
    MissingTitle,
    #[error("章节数必须大于 0")]
    ZeroChapters,
    #[error("检查未通过:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(name = "novelctl", version, about = "AI 小说生成器命令行工具")]
struct Cli {
    /// 配置文件所在目录（读取 config.yaml / config.json / .env）
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 工具注册表相关操作
    #[command(subcommand)]
    Tools(ToolsCommand),
    /// 生成完整小说
    Generate(GenerateArgs),
    /// 配置相关操作
    #[command(subcommand)]
    Config(ConfigCommand),
    /// 缓存相关操作
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// 列出已注册的工具
    List(ToolListArgs),
    /// 按名称、描述或分类搜索工具
    Search(ToolSearchArgs),
    /// 以 JSON 参数执行单个工具
    Run(ToolRunArgs),
    /// 校验全部工具定义
    Validate,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 输出合并后的配置（隐藏 API Key）
    Show,
    /// 检查配置是否完整
    Check,
    /// 测试当前 LLM 接口配置
    TestLlm,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// 显示缓存配置与统计
    Stats,
}

#[derive(Args)]
struct ToolListArgs {
    /// 只显示指定分类
    #[arg(long)]
    category: Option<String>,
    /// 包含隐藏的工具
    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct ToolSearchArgs {
    /// 搜索关键词
    query: String,
}

#[derive(Args)]
struct ToolRunArgs {
    /// 工具名称或别名
    name: String,
    /// JSON 对象形式的参数
    #[arg(long, value_name = "JSON", default_value = "{}")]
    params: String,
}

#[derive(Args)]
struct GenerateArgs {
    /// 小说标题
    #[arg(long)]
    title: String,
    /// 小说类型，默认使用配置中的 default_genre
    #[arg(long)]
    genre: Option<String>,
    /// 小说主题
    #[arg(long)]
    theme: Option<String>,
    /// 章节数
    #[arg(long, value_name = "N")]
    chapters: Option<u32>,
    /// 每章目标字数
    #[arg(long, value_name = "N")]
    words: Option<u32>,
    /// 写作风格：traditional / modern / poetic / action
    #[arg(long)]
    style: Option<String>,
    /// 输出目录，默认使用配置中的 output_dir
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
}
