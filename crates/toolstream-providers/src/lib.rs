use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use toolstream_types::{ContentPart, ConversationMessage, MessageRole, ProviderInfo, ToolCall, ToolSchema};

mod error;
mod openai;
mod scripted;

pub use error::ProviderError;
pub use openai::{api_key_env_var, known_provider_ids, OpenAICompatibleProvider};
pub use scripted::{ScriptedProvider, ScriptedTurn};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    /// Providers to switch to, in order, when the selected one keeps failing
    /// with transport errors.
    #[serde(default)]
    pub fallback_providers: Vec<String>,
}

/// Wire-level chat message. Tool results travel as `tool` role messages
/// carrying the id of the call they answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Flattens structured conversation messages into wire messages.
    pub fn from_conversation(messages: &[ConversationMessage]) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            if message.role == MessageRole::Tool {
                for part in &message.content {
                    if let ContentPart::ToolResult {
                        tool_call_id,
                        result,
                        ..
                    } = part
                    {
                        out.push(ChatMessage {
                            role: "tool".to_string(),
                            content: result.to_string(),
                            tool_calls: Vec::new(),
                            tool_call_id: Some(tool_call_id.clone()),
                        });
                    }
                }
                continue;
            }

            let mut text = Vec::new();
            let mut tool_calls = Vec::new();
            for part in &message.content {
                match part {
                    ContentPart::Text { text: t } => text.push(t.as_str()),
                    ContentPart::ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    } => tool_calls.push(ToolCall::new(tool_call_id, tool_name, args.clone())),
                    ContentPart::ToolResult { .. } => {}
                }
            }
            out.push(ChatMessage {
                role: message.role.as_str().to_string(),
                content: text.join("\n"),
                tool_calls,
                tool_call_id: None,
            });
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
    },
    Done {
        finish_reason: String,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String>;
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self.complete(&prompt, model_override).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta { text: response }),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
    fallback_providers: Arc<RwLock<Vec<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = openai::build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
            fallback_providers: Arc::new(RwLock::new(config.fallback_providers)),
        }
    }

    pub fn with_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
            fallback_providers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_fallbacks(self, fallback_providers: Vec<String>) -> Self {
        Self {
            fallback_providers: Arc::new(RwLock::new(fallback_providers)),
            ..self
        }
    }

    pub async fn reload(&self, config: ProvidersConfig) {
        let rebuilt = openai::build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
        *self.fallback_providers.write().await = config.fallback_providers;
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.info().id;
        let mut providers = self.providers.write().await;
        providers.retain(|p| p.info().id != id);
        providers.push(provider);
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn select(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();
            return Err(ProviderError::NotConfigured {
                provider: id.to_string(),
                available: available.join(", "),
            }
            .into());
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
            tracing::debug!(provider = %default_id, "default provider missing, using first configured");
        };

        let Some(provider) = providers.first() else {
            return Err(ProviderError::NoneConfigured.into());
        };
        Ok(provider.clone())
    }

    /// The selected provider followed by the configured fallbacks, each once.
    /// Fallback ids that are not configured are skipped.
    pub async fn fallback_chain(&self, provider_id: Option<&str>) -> anyhow::Result<Vec<Arc<dyn Provider>>> {
        let primary = self.select(provider_id).await?;
        let mut seen = vec![primary.info().id];
        let mut chain = vec![primary];
        let providers = self.providers.read().await;
        for id in self.fallback_providers.read().await.iter() {
            if seen.contains(id) {
                continue;
            }
            match providers.iter().find(|p| &p.info().id == id) {
                Some(provider) => {
                    seen.push(id.clone());
                    chain.push(provider.clone());
                }
                None => tracing::debug!(provider = %id, "fallback provider not configured, skipping"),
            }
        }
        Ok(chain)
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select(provider_id).await?;
        provider.stream(messages, model_id, tools, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProvidersConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
            fallback_providers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry.select(Some("openrouter")).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("anthropic")));
        let provider = registry.select(None).await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn unknown_provider_is_a_typed_error() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry.select(Some("openruter")).await.err().expect("error");
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::NotConfigured { .. })
        ));
        assert!(err.to_string().contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn empty_registry_reports_none_configured() {
        let registry = ProviderRegistry::default();
        let err = registry.select(None).await.err().expect("error");
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::NoneConfigured)
        ));
    }

    #[tokio::test]
    async fn fallback_chain_follows_configured_order() {
        let mut config = cfg(&["openai", "groq", "mistral"], Some("openai"));
        config.fallback_providers = vec![
            "mistral".to_string(),
            "openai".to_string(),
            "together".to_string(),
            "groq".to_string(),
        ];
        let registry = ProviderRegistry::new(config);
        let chain = registry.fallback_chain(None).await.expect("chain");
        let ids = chain.iter().map(|p| p.info().id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["openai", "mistral", "groq"]);

        let chain = registry.fallback_chain(Some("groq")).await.expect("chain");
        let ids = chain.iter().map(|p| p.info().id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["groq", "mistral", "openai"]);
    }

    #[tokio::test]
    async fn register_replaces_provider_with_same_id() {
        let registry = ProviderRegistry::default();
        registry.register(Arc::new(ScriptedProvider::new("scripted"))).await;
        registry.register(Arc::new(ScriptedProvider::new("scripted"))).await;
        assert_eq!(registry.list().await.len(), 1);
    }

    #[test]
    fn conversation_flattens_tool_results_into_tool_messages() {
        let messages = vec![
            ConversationMessage::user("find orders"),
            ConversationMessage::assistant_tool_call("call-1", "search", json!({"q": "orders"})),
            ConversationMessage::tool_result("call-1", "search", json!({"hits": 2})),
        ];
        let wire = ChatMessage::from_conversation(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1].tool_calls[0].name, "search");
        assert_eq!(wire[2].role, "tool");
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(wire[2].content, r#"{"hits":2}"#);
    }

    #[test]
    fn stream_chunks_round_trip_through_jsonl_shape() {
        let line = r#"{"type":"tool_call_delta","id":"call-1","args_delta":"{\"a\""}"#;
        let chunk: StreamChunk = serde_json::from_str(line).expect("chunk");
        assert_eq!(
            chunk,
            StreamChunk::ToolCallDelta {
                id: "call-1".to_string(),
                args_delta: "{\"a\"".to_string()
            }
        );
    }
}
