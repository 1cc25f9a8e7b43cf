use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use toolstream_types::{ModelInfo, ProviderInfo, ToolSchema};

use crate::{ChatMessage, ChunkStream, Provider, ProviderError, ProvidersConfig, StreamChunk, TokenUsage};

const KNOWN_PROVIDERS: &[(&str, &str, &str, &str, bool)] = &[
    ("ollama", "Ollama", "http://127.0.0.1:11434/v1", "llama3.1:8b", false),
    ("openai", "OpenAI", "https://api.openai.com/v1", "gpt-4o-mini", true),
    ("openrouter", "OpenRouter", "https://openrouter.ai/api/v1", "openai/gpt-4o-mini", true),
    ("groq", "Groq", "https://api.groq.com/openai/v1", "llama-3.1-8b-instant", true),
    ("mistral", "Mistral", "https://api.mistral.ai/v1", "mistral-small-latest", true),
    ("together", "Together", "https://api.together.xyz/v1", "meta-llama/Llama-3.1-8B-Instruct-Turbo", true),
];

pub(crate) fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for (id, name, default_url, default_model, use_api_key) in KNOWN_PROVIDERS {
        let Some(entry) = config.providers.get(*id) else {
            continue;
        };
        let api_key = if *use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(str::to_string)
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        };
        providers.push(Arc::new(OpenAICompatibleProvider {
            id: id.to_string(),
            name: name.to_string(),
            base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
            api_key,
            default_model: entry
                .default_model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            client: Client::new(),
        }));
    }
    providers
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

/// Ids of the OpenAI-compatible providers this crate knows how to build.
pub fn known_provider_ids() -> impl Iterator<Item = &'static str> {
    KNOWN_PROVIDERS.iter().map(|(id, ..)| *id)
}

/// Environment variable holding the API key for a provider id.
pub fn api_key_env_var(id: &str) -> Option<&'static str> {
    match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    std::env::var(api_key_env_var(id)?)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(id: impl Into<String>, base_url: &str, api_key: Option<String>, default_model: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.into(),
            client: Client::new(),
        }
    }

    fn model<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String> {
        let model = self.model(model_override);
        let response = self
            .request(&json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "stream": false,
            }))
            .send()
            .await
            .map_err(ProviderError::from)?;
        let status = response.status();
        let text = response.text().await.map_err(ProviderError::from)?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail: truncate_for_error(&text, 500),
            }
            .into());
        }
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse {
                model: model.to_string(),
            }
            .into());
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|err| ProviderError::MalformedPayload(err.to_string()))?;
        if let Some(detail) = extract_openai_error(&value) {
            return Err(ProviderError::Api(detail).into());
        }
        extract_openai_text(&value).ok_or_else(|| {
            ProviderError::EmptyResponse {
                model: model.to_string(),
            }
            .into()
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = self.model(model_override).to_string();
        let mut body = json!({
            "model": model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let wire_tools = tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let resp = self.request(&body).send().await.map_err(ProviderError::from)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail: truncate_for_error(&text, 500),
            }
            .into());
        }

        tracing::debug!(provider = %self.id, model = %model, "provider stream opened");
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut decoder = SseDecoder::default();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = bytes.next() => Some(chunk),
                };
                let Some(next) = next else {
                    for chunk in decoder.cancel() {
                        yield chunk;
                    }
                    break;
                };
                let Some(chunk) = next else {
                    for chunk in decoder.finish("stop") {
                        yield chunk;
                    }
                    break;
                };
                let chunk = chunk.map_err(ProviderError::from)?;
                for decoded in decoder.push(&chunk)? {
                    yield decoded;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut wire = json!({"role": message.role, "content": message.content});
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.args.to_string()},
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

/// Turns OpenAI-style SSE bytes into stream chunks.
///
/// Only the first delta of a tool call carries its id; later deltas refer to
/// the call by `index`, so ids are remembered per index. Calls stay open until
/// the choice reports a finish reason. `Done` waits for `[DONE]` or the end of
/// the body, since usage arrives in a later chunk with no choices.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    pending: Vec<u8>,
    ids_by_index: HashMap<u64, String>,
    open_calls: Vec<String>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamChunk>, ProviderError> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some((pos, delimiter)) = find_frame_end(&self.pending) {
            let frame: Vec<u8> = self.pending.drain(..pos + delimiter).collect();
            let frame = String::from_utf8_lossy(&frame[..pos]).into_owned();
            for line in frame.split(['\r', '\n']) {
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    out.extend(self.finish("stop"));
                    continue;
                }
                let value = serde_json::from_str::<Value>(payload)
                    .map_err(|err| ProviderError::MalformedPayload(err.to_string()))?;
                self.decode_payload(&value, &mut out)?;
            }
        }
        Ok(out)
    }

    fn decode_payload(&mut self, value: &Value, out: &mut Vec<StreamChunk>) -> Result<(), ProviderError> {
        if let Some(detail) = extract_openai_error(value) {
            return Err(ProviderError::Api(detail));
        }
        if let Some(usage) = extract_usage(value) {
            self.usage = Some(usage);
        }
        let choices = value
            .get("choices")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for choice in choices {
            let delta = choice.get("delta").unwrap_or(&Value::Null);

            for key in ["reasoning_content", "reasoning"] {
                if let Some(text) = delta.get(key).and_then(Value::as_str) {
                    if !text.is_empty() {
                        out.push(StreamChunk::ReasoningDelta {
                            text: text.to_string(),
                        });
                    }
                }
            }
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(StreamChunk::TextDelta {
                        text: text.to_string(),
                    });
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in tool_calls {
                    self.decode_tool_call(call, out);
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                if !reason.is_empty() {
                    out.extend(self.close_calls());
                    self.finish_reason = Some(reason.to_string());
                }
            }
        }
        Ok(())
    }

    fn decode_tool_call(&mut self, call: &Value, out: &mut Vec<StreamChunk>) {
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
        let function = call.get("function").unwrap_or(&Value::Null);
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let explicit_id = call
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty());

        let known = self.ids_by_index.get(&index).cloned();
        let id = match (explicit_id, known) {
            (Some(id), Some(known)) if id == known => known,
            (Some(id), _) => self.open_call(index, id.to_string(), name, out),
            (None, Some(known)) => known,
            (None, None) => self.open_call(index, format!("call_{index}"), name, out),
        };

        if let Some(args_delta) = function.get("arguments").and_then(Value::as_str) {
            if !args_delta.is_empty() {
                out.push(StreamChunk::ToolCallDelta {
                    id,
                    args_delta: args_delta.to_string(),
                });
            }
        }
    }

    fn open_call(&mut self, index: u64, id: String, name: &str, out: &mut Vec<StreamChunk>) -> String {
        self.ids_by_index.insert(index, id.clone());
        self.open_calls.push(id.clone());
        out.push(StreamChunk::ToolCallStart {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    fn close_calls(&mut self) -> Vec<StreamChunk> {
        self.open_calls
            .drain(..)
            .map(|id| StreamChunk::ToolCallEnd { id, args: None })
            .collect()
    }

    /// Closes every open tool call and emits the terminal `Done` chunk once,
    /// with the finish reason the choice reported or `fallback_reason`.
    pub(crate) fn finish(&mut self, fallback_reason: &str) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = self.close_calls();
        out.push(StreamChunk::Done {
            finish_reason: self
                .finish_reason
                .take()
                .unwrap_or_else(|| fallback_reason.to_string()),
            usage: self.usage.take(),
        });
        out
    }

    pub(crate) fn cancel(&mut self) -> Vec<StreamChunk> {
        self.finish_reason = Some("cancelled".to_string());
        self.finish("cancelled")
    }
}

/// Start of the first blank line and the length of the line breaks that make
/// it. Events may be separated by `\n\n`, `\r\n\r\n` or `\r\r`.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if rest.starts_with(b"\n\n") || rest.starts_with(b"\r\r") {
            Some((i, 2))
        } else {
            None
        }
    })
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|usage| usage.is_object())?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let prompt_tokens = field("prompt_tokens");
    let completion_tokens = field("completion_tokens");
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let message = value.get("choices")?.get(0)?;
    message
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| message.get("text"))
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
}

fn extract_openai_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}
