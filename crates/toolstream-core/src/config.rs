use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use toolstream_providers::{api_key_env_var, ProviderConfig, ProvidersConfig};

const PROVIDER_DEFAULTS: &[(&str, &str, &str)] = &[
    ("openai", "https://api.openai.com/v1", "gpt-4o-mini"),
    ("openrouter", "https://openrouter.ai/api/v1", "openai/gpt-4o-mini"),
    ("groq", "https://api.groq.com/openai/v1", "llama-3.1-8b-instant"),
    ("mistral", "https://api.mistral.ai/v1", "mistral-small-latest"),
    ("together", "https://api.together.xyz/v1", "meta-llama/Llama-3.1-8B-Instruct-Turbo"),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_backoff_ms: default_max_backoff_ms(),
            exponential_backoff: true,
        }
    }
}

impl RetryConfig {
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairConfig {
    #[serde(default = "default_repair_attempts")]
    pub max_attempts: usize,
    /// Strategy names, tried in order.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_repair_attempts(),
            strategies: default_strategies(),
        }
    }
}

/// When to trim conversation history before a provider request. Either
/// threshold triggers a trim; `keep_recent` messages always survive it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_token_threshold")]
    pub token_threshold: usize,
    #[serde(default = "default_message_threshold")]
    pub message_threshold: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_threshold: default_token_threshold(),
            message_threshold: default_message_threshold(),
            keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Json,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
            fallback_providers: self.fallback_providers.clone(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_true() -> bool {
    true
}

fn default_token_threshold() -> usize {
    100_000
}

fn default_message_threshold() -> usize {
    80
}

fn default_keep_recent() -> usize {
    12
}

fn default_repair_attempts() -> usize {
    3
}

fn default_strategies() -> Vec<String> {
    ["tool_name_correction", "schema_guided_regeneration", "clarifying_reask"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_retention_days() -> u64 {
    7
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration. Later layers win:
/// global file, project file, environment, runtime patches, CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_paths(path, global_path, cli_overrides, env_layer()).await
    }

    pub async fn with_paths(
        project_path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
        env: Value,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();

        let mut global = read_json_file(&global_path).await?;
        let mut project = read_json_file(&project_path).await?;
        scrub_persisted_secrets(&mut global, &global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "effective config does not match schema, using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await;
        let mut merged = empty_object();
        for layer in [&layers.global, &layers.project, &layers.env, &layers.runtime, &layers.cli] {
            deep_merge(&mut merged, layer);
        }
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        let snapshot = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
            layers.project.clone()
        };
        write_json_file(&self.project_path, &snapshot).await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        let snapshot = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
            layers.global.clone()
        };
        write_json_file(&self.global_path, &snapshot).await?;
        Ok(self.get_effective_value().await)
    }

    /// In-memory only; lost on restart.
    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get_effective_value().await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), error = %err, "ignoring unparsable config file");
        empty_object()
    }))
}

pub async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Removes provider API keys that are also available from the environment,
/// so secrets supplied at runtime never end up on disk.
fn strip_persisted_secrets(value: &mut Value) {
    strip_secrets_with(value, &|key| std::env::var(key).ok());
}

fn strip_secrets_with(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    let Some(providers) = value
        .get_mut("providers")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if !cfg.contains_key("api_key") && !cfg.contains_key("apiKey") {
            continue;
        }
        let has_runtime_secret = provider_env_candidates(provider_id)
            .iter()
            .any(|key| lookup(key).is_some_and(|v| !v.trim().is_empty()));
        if has_runtime_secret {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        write_json_file(path, value).await?;
    }
    Ok(())
}

fn provider_env_candidates(provider_id: &str) -> Vec<String> {
    let normalized = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();
    let mut out = vec![format!("{normalized}_API_KEY")];
    if let Some(known) = api_key_env_var(&provider_id.to_ascii_lowercase()) {
        out.push(known.to_string());
    }
    out.sort();
    out.dedup();
    out
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("TOOLSTREAM_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("toolstream").join("config.json"));
    }
    Ok(PathBuf::from(".toolstream/global_config.json"))
}

/// Default state directory: `TOOLSTREAM_STATE_DIR`, else the platform data dir.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLSTREAM_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("toolstream"))
        .unwrap_or_else(|| PathBuf::from(".toolstream"))
}

pub fn env_layer() -> Value {
    env_layer_from(&|key| std::env::var(key).ok())
}

pub fn env_layer_from(lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(raw) = non_empty("TOOLSTREAM_MAX_RETRIES") {
        match raw.trim().parse::<u32>() {
            Ok(n) => deep_merge(&mut root, &json!({"retry": {"max_retries": n}})),
            Err(_) => tracing::warn!(value = %raw, "ignoring TOOLSTREAM_MAX_RETRIES"),
        }
    }
    if let Some(raw) = non_empty("TOOLSTREAM_MAX_BACKOFF_MS") {
        if let Ok(ms) = raw.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({"retry": {"max_backoff_ms": ms}}));
        }
    }
    if let Some(enabled) = non_empty("TOOLSTREAM_EXPONENTIAL_BACKOFF").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({"retry": {"exponential_backoff": enabled}}));
    }
    if let Some(raw) = non_empty("TOOLSTREAM_REPAIR_MAX_ATTEMPTS") {
        match raw.trim().parse::<usize>() {
            Ok(n) => deep_merge(&mut root, &json!({"repair": {"max_attempts": n}})),
            Err(_) => tracing::warn!(value = %raw, "ignoring TOOLSTREAM_REPAIR_MAX_ATTEMPTS"),
        }
    }
    if let Some(dir) = non_empty("TOOLSTREAM_STATE_DIR") {
        deep_merge(&mut root, &json!({"storage": {"state_dir": dir}}));
    }
    if let Some(provider) = non_empty("TOOLSTREAM_DEFAULT_PROVIDER") {
        deep_merge(&mut root, &json!({"default_provider": provider}));
    }
    if let Some(raw) = non_empty("TOOLSTREAM_FALLBACK_PROVIDERS") {
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        deep_merge(&mut root, &json!({"fallback_providers": ids}));
    }
    if let Some(enabled) = non_empty("TOOLSTREAM_COMPRESS_HISTORY").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({"compression": {"enabled": enabled}}));
    }

    for &(provider, url, model) in PROVIDER_DEFAULTS {
        let Some(key_env) = api_key_env_var(provider) else {
            continue;
        };
        if let Some(api_key) = non_empty(key_env) {
            deep_merge(
                &mut root,
                &json!({
                    "providers": {
                        provider: {"api_key": api_key, "url": url, "default_model": model}
                    }
                }),
            );
        }
    }
    if let Some(ollama_url) = non_empty("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({"providers": {"ollama": {"url": ollama_url, "default_model": "llama3.1:8b"}}}),
        );
    }

    root
}

pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Recursive object merge; `null` in the overlay leaves the base untouched.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
