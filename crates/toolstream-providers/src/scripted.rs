use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use toolstream_types::{ModelInfo, ProviderInfo, ToolSchema};

use crate::{ChatMessage, ChunkStream, Provider, ProviderError, StreamChunk};

/// One scripted reply to a `stream` call.
#[derive(Debug)]
pub enum ScriptedTurn {
    Stream(Vec<StreamChunk>),
    Fail(ProviderError),
}

impl ScriptedTurn {
    /// A single tool call whose argument text arrives in `piece_len`-char deltas.
    pub fn tool_call(id: &str, name: &str, args_text: &str, piece_len: usize) -> Self {
        let mut chunks = vec![StreamChunk::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        }];
        let chars: Vec<char> = args_text.chars().collect();
        for piece in chars.chunks(piece_len.max(1)) {
            chunks.push(StreamChunk::ToolCallDelta {
                id: id.to_string(),
                args_delta: piece.iter().collect(),
            });
        }
        chunks.push(StreamChunk::ToolCallEnd {
            id: id.to_string(),
            args: None,
        });
        chunks.push(StreamChunk::Done {
            finish_reason: "tool_calls".to_string(),
            usage: None,
        });
        ScriptedTurn::Stream(chunks)
    }

    pub fn text(text: &str) -> Self {
        ScriptedTurn::Stream(vec![
            StreamChunk::TextDelta {
                text: text.to_string(),
            },
            StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            },
        ])
    }
}

/// Provider that replays canned turns. Used by tests and CLI replays.
pub struct ScriptedProvider {
    id: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    completions: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_turn(mut self, turn: ScriptedTurn) -> Self {
        self.turns.get_mut().push_back(turn);
        self
    }

    pub fn with_completion(mut self, text: impl Into<String>) -> Self {
        self.completions.get_mut().push_back(text.into());
        self
    }

    /// Messages passed to each `stream` call, oldest first.
    pub async fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().await.clone()
    }

    /// Prompts passed to each `complete` call, oldest first.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: self.id.clone(),
                display_name: "Scripted Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(&self, prompt: &str, _model_override: Option<&str>) -> anyhow::Result<String> {
        self.prompts.lock().await.push(prompt.to_string());
        self.completions.lock().await.pop_front().ok_or_else(|| {
            ProviderError::EmptyResponse {
                model: "scripted-1".to_string(),
            }
            .into()
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        self.requests.lock().await.push(messages);
        match self.turns.lock().await.pop_front() {
            Some(ScriptedTurn::Stream(chunks)) => {
                Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok::<_, anyhow::Error>))))
            }
            Some(ScriptedTurn::Fail(err)) => Err(err.into()),
            None => Err(ProviderError::EmptyResponse {
                model: "scripted-1".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn replays_turns_in_order_then_reports_empty() {
        let provider = ScriptedProvider::new("scripted")
            .with_turn(ScriptedTurn::tool_call("c1", "done", r#"{"final_response":"ok"}"#, 5))
            .with_turn(ScriptedTurn::Fail(ProviderError::Status {
                status: 503,
                detail: "overloaded".to_string(),
            }));

        let chunks: Vec<_> = provider
            .stream(vec![ChatMessage::new("user", "hi")], None, None, CancellationToken::new())
            .await
            .expect("stream")
            .collect()
            .await;
        let args: String = chunks
            .iter()
            .filter_map(|c| match c {
                Ok(StreamChunk::ToolCallDelta { args_delta, .. }) => Some(args_delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"final_response":"ok"}"#);

        let second = provider
            .stream(Vec::new(), None, None, CancellationToken::new())
            .await
            .err()
            .expect("scripted failure");
        assert_eq!(second.downcast_ref::<ProviderError>().and_then(ProviderError::status), Some(503));

        assert!(provider
            .stream(Vec::new(), None, None, CancellationToken::new())
            .await
            .is_err());
        assert_eq!(provider.requests().await.len(), 3);
    }
}
