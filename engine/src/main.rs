use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use toolstream_core::{
    default_state_dir, AppConfig, ConfigStore, JsonFileEntryStore, MemoryEntryStore, MessageEntryStore, StorageBackend,
    ToolCallRepairer, ToolStreamRunner, TurnContext, TurnOutcome,
};
use toolstream_json::{OptimisticJsonParser, OptimisticParseResult, StreamingJsonAccumulator};
use toolstream_observability::{
    canonical_logs_dir_from_root, emit_event, init_console_logging, init_process_logging, ObservabilityEvent,
    ProcessKind,
};
use toolstream_providers::{known_provider_ids, ChunkStream, ProviderRegistry, StreamChunk};
use toolstream_tools::ToolCatalog;
use toolstream_types::{ConversationMessage, ToolSchema};

#[derive(Parser, Debug)]
#[command(name = "toolstream")]
#[command(about = "Stream model tool calls through optimistic parsing, persistence and repair")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Optimistically parse JSON text that may be incomplete.
    Parse {
        /// Inline text, `@path` or `-` for stdin.
        input: String,
        /// Feed the text in pieces of this many characters and print every step.
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Feed a JSONL recording of stream chunks through the tool-call lifecycle.
    Replay {
        /// `@path`, a plain path, or `-` for stdin.
        recording: String,
        #[arg(long)]
        tools: Option<String>,
        #[arg(long)]
        message_id: Option<String>,
        #[arg(long, default_value = "replay")]
        chat_id: String,
        #[arg(long)]
        state_dir: Option<String>,
        /// Keep entries in memory instead of writing them under the state dir.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Stream one turn from a configured provider, with repair.
    Run {
        prompt: String,
        #[arg(long)]
        tools: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        step: Option<String>,
        #[arg(long, env = "TOOLSTREAM_API_KEY")]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Parse { input, chunk_size } => {
            init_console_logging("warn");
            let text = read_input(&input)?;
            match chunk_size {
                Some(size) => {
                    let mut accumulator = StreamingJsonAccumulator::new();
                    let chars = text.chars().collect::<Vec<_>>();
                    for piece in chars.chunks(size.max(1)) {
                        let piece = piece.iter().collect::<String>();
                        let update = accumulator.push(&piece);
                        let line = json!({
                            "delta": piece,
                            "added": update.added,
                            "changed": update.changed,
                            "result": parse_summary(&update.result),
                        });
                        println!("{}", serde_json::to_string(&line)?);
                    }
                }
                None => {
                    let result = OptimisticJsonParser::parse(&text);
                    println!("{}", serde_json::to_string_pretty(&parse_summary(&result))?);
                }
            }
        }
        Command::Replay {
            recording,
            tools,
            message_id,
            chat_id,
            state_dir,
            dry_run,
        } => {
            let config = load_config(&resolve_state_dir(state_dir.clone(), None), None, None).await?;
            let state_dir = resolve_state_dir(state_dir, config.storage.state_dir.clone());
            let _log_guard = init_logging(ProcessKind::Cli, &state_dir, &config)?;

            let chunks = parse_recording(&read_input(&recording)?)?;
            let catalog = build_catalog(tools.as_deref()).await?;
            let validate = tools.is_some();
            let backend = if dry_run {
                StorageBackend::Memory
            } else {
                config.storage.backend
            };
            let store = open_store(&backend, &state_dir).await?;
            let runner = ToolStreamRunner::new(ProviderRegistry::default(), catalog, store.clone())
                .with_repairer(ToolCallRepairer::from_config(&config.repair))
                .with_retry(config.retry.clone());

            let message_id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let ctx = TurnContext {
                message_id: message_id.clone(),
                chat_id,
                ..TurnContext::default()
            };
            info!(message_id = %message_id, chunks = chunks.len(), "replaying recording");
            let stream: ChunkStream = Box::pin(futures::stream::iter(chunks.into_iter().map(Ok::<_, anyhow::Error>)));
            let consumed = runner.consume(stream, &ctx).await?;
            let entries = store.entries(&message_id).await;
            store.close().await?;

            let failures = if validate {
                consumed
                    .failures
                    .iter()
                    .map(|failure| {
                        json!({
                            "toolCallID": failure.call().id,
                            "toolName": failure.call().name,
                            "code": failure.code(),
                            "detail": failure.healing_text(None),
                        })
                    })
                    .collect::<Vec<_>>()
            } else {
                Vec::new()
            };
            let output = json!({
                "messageID": message_id,
                "text": consumed.text,
                "entries": entries,
                "failures": failures,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Run {
            prompt,
            tools,
            system,
            step,
            api_key,
            provider,
            model,
            config,
            state_dir,
        } => {
            let provider = normalize_and_validate_provider(provider)?;
            let overrides = build_cli_overrides(api_key, provider.clone(), model.clone())?;
            let app_config = load_config(
                &resolve_state_dir(state_dir.clone(), None),
                config.map(PathBuf::from),
                overrides,
            )
            .await?;
            let state_dir = resolve_state_dir(state_dir, app_config.storage.state_dir.clone());
            let _log_guard = init_logging(ProcessKind::Cli, &state_dir, &app_config)?;

            let catalog = build_catalog(tools.as_deref()).await?;
            let store = open_store(&app_config.storage.backend, &state_dir).await?;
            let runner = ToolStreamRunner::new(
                ProviderRegistry::new(app_config.providers_config()),
                catalog,
                store.clone(),
            )
            .with_repairer(ToolCallRepairer::from_config(&app_config.repair))
            .with_retry(app_config.retry.clone())
            .with_compression(app_config.compression.clone());

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ConversationMessage::system(system));
            }
            messages.push(ConversationMessage::user(prompt));

            let ctx = TurnContext {
                message_id: Uuid::new_v4().to_string(),
                chat_id: Uuid::new_v4().to_string(),
                provider_id: provider,
                model,
                current_step: step,
                ..TurnContext::default()
            };
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let outcome = runner.run_turn(messages, &ctx).await;
            store.close().await?;
            let outcome = outcome?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Cli,
                ObservabilityEvent {
                    message_id: Some(ctx.message_id.as_str()),
                    attempt: Some(outcome.attempts),
                    status: Some(if outcome.unresolved.is_empty() { "ok" } else { "unresolved" }),
                    ..ObservabilityEvent::new("cli.run", "run.finished")
                },
            );
            println!("{}", serde_json::to_string_pretty(&run_summary(&ctx.message_id, &outcome))?);
        }
    }

    Ok(())
}

fn parse_summary(result: &OptimisticParseResult) -> Value {
    json!({
        "isComplete": result.is_complete,
        "malformed": result.malformed,
        "parsed": result.parsed,
        "repairedJson": result.repaired_json(),
        "extractedValues": result.extracted_values,
    })
}

fn run_summary(message_id: &str, outcome: &TurnOutcome) -> Value {
    json!({
        "messageID": message_id,
        "text": outcome.text,
        "toolCalls": outcome.tool_calls,
        "unresolved": outcome
            .unresolved
            .iter()
            .map(|failure| json!({
                "toolCallID": failure.call().id,
                "toolName": failure.call().name,
                "code": failure.code(),
            }))
            .collect::<Vec<_>>(),
        "attempts": outcome.attempts,
        "usage": outcome.usage,
    })
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();
    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }

    // api_key and model apply to the selected provider, openai when none is given
    let target_provider = provider.as_deref().unwrap_or("openai");
    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }
        let mut providers = serde_json::Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let supported = known_provider_ids().collect::<Vec<_>>();
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!("provider cannot be empty. supported providers: {}", supported.join(", "));
    }
    if supported.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        supported.join(", ")
    );
}

/// Flag first, then the configured directory, then the platform default.
fn resolve_state_dir(flag: Option<String>, configured: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag.filter(|dir| !dir.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    configured.unwrap_or_else(default_state_dir)
}

async fn load_config(state_dir: &Path, config_path: Option<PathBuf>, overrides: Option<Value>) -> anyhow::Result<AppConfig> {
    let config_path = config_path.unwrap_or_else(|| state_dir.join("config.json"));
    let store = ConfigStore::new(&config_path, overrides)
        .await
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    Ok(store.get().await)
}

fn init_logging(
    process: ProcessKind,
    state_dir: &Path,
    config: &AppConfig,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = canonical_logs_dir_from_root(state_dir);
    let (guard, log_info) = init_process_logging(process, &logs_dir, config.logging.retention_days)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..ObservabilityEvent::new("cli.main", "logging.initialized")
        },
    );
    info!("logging initialized: {:?}", log_info);
    Ok(guard)
}

async fn open_store(backend: &StorageBackend, state_dir: &Path) -> anyhow::Result<Arc<dyn MessageEntryStore>> {
    Ok(match backend {
        StorageBackend::Json => {
            let base = state_dir.join("entries");
            let store = JsonFileEntryStore::open(&base)
                .await
                .with_context(|| format!("opening entry store at {}", base.display()))?;
            Arc::new(store)
        }
        StorageBackend::Memory => Arc::new(MemoryEntryStore::new()),
    })
}

/// Tools come as a JSON array of schemas, or an object with a `tools` array.
async fn build_catalog(tools: Option<&str>) -> anyhow::Result<ToolCatalog> {
    let Some(tools) = tools else {
        return Ok(ToolCatalog::new());
    };
    let payload = read_json_input(tools)?;
    let list = payload.get("tools").cloned().unwrap_or(payload);
    let schemas: Vec<ToolSchema> = serde_json::from_value(list).context("tool schemas must be a JSON array")?;
    Ok(ToolCatalog::from_schemas(schemas).await?)
}

fn parse_recording(raw: &str) -> anyhow::Result<Vec<StreamChunk>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<StreamChunk>(line).with_context(|| format!("recording line {}", index + 1))
        })
        .collect()
}

/// `-` reads stdin, `@path` reads a file. Anything else is taken literally,
/// unless it names an existing file.
fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return fs::read_to_string(path).with_context(|| format!("reading {path}"));
    }
    if Path::new(input).is_file() {
        return fs::read_to_string(input).with_context(|| format!("reading {input}"));
    }
    Ok(input.to_string())
}

fn read_json_input(input: &str) -> anyhow::Result<Value> {
    let raw = read_input(input)?;
    serde_json::from_str(&raw).context("input is not valid JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("google/gemini-2.5-flash".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(overrides["providers"]["openrouter"]["api_key"], json!("sk-test"));
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("google/gemini-2.5-flash")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_to_openai_without_provider() {
        let overrides = build_cli_overrides(None, None, Some("gpt-4o-mini".to_string()))
            .expect("overrides")
            .expect("some");
        assert!(overrides.get("default_provider").is_none());
        assert_eq!(overrides["providers"]["openai"]["default_model"], json!("gpt-4o-mini"));
        assert!(build_cli_overrides(None, None, None).expect("overrides").is_none());
    }

    #[test]
    fn provider_names_are_normalized_and_checked() {
        let provider = normalize_and_validate_provider(Some(" Groq ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("groq"));
        let err = normalize_and_validate_provider(Some("openruter".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `openruter`"));
    }

    #[test]
    fn recording_lines_become_chunks() {
        let raw = concat!(
            "{\"type\": \"tool_call_start\", \"id\": \"c1\", \"name\": \"done\"}\n",
            "\n",
            "{\"type\": \"tool_call_delta\", \"id\": \"c1\", \"args_delta\": \"{\\\"final_response\\\": \\\"hi\\\"}\"}\n",
            "{\"type\": \"done\", \"finish_reason\": \"tool_calls\"}\n",
        );
        let chunks = parse_recording(raw).expect("chunks");
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks[0],
            StreamChunk::ToolCallStart {
                id: "c1".to_string(),
                name: "done".to_string()
            }
        );

        let err = parse_recording("{\"type\": \"nope\"}").unwrap_err();
        assert!(format!("{err:#}").contains("recording line 1"));
    }

    #[test]
    fn read_input_accepts_files_and_literals() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{{\"a\": 1").expect("write");
        let path = file.path().display().to_string();
        assert_eq!(read_input(&format!("@{path}")).expect("read"), "{\"a\": 1");
        assert_eq!(read_input(&path).expect("read"), "{\"a\": 1");
        assert_eq!(read_input("{\"b\"").expect("read"), "{\"b\"");
    }

    #[tokio::test]
    async fn catalog_accepts_bare_array_or_tools_object() {
        let catalog = build_catalog(Some(
            r#"{"tools": [{"name": "done", "description": "finish", "parameters": {"type": "object", "properties": {}}}]}"#,
        ))
        .await
        .expect("catalog");
        assert_eq!(catalog.names().await, vec!["done".to_string()]);
        assert!(build_catalog(None).await.expect("empty").names().await.is_empty());
    }

    #[test]
    fn state_dir_prefers_flag_then_config() {
        assert_eq!(
            resolve_state_dir(Some("/tmp/flag".to_string()), Some(PathBuf::from("/tmp/cfg"))),
            PathBuf::from("/tmp/flag")
        );
        assert_eq!(
            resolve_state_dir(None, Some(PathBuf::from("/tmp/cfg"))),
            PathBuf::from("/tmp/cfg")
        );
    }
}
