use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use toolstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use toolstream_providers::{ChatMessage, ChunkStream, Provider, ProviderRegistry, StreamChunk, TokenUsage};
use toolstream_tools::ToolCatalog;
use toolstream_types::{ContentPart, ConversationMessage, MessageRole, ToolCall};

use crate::compression::{compress_history, should_compress_history};
use crate::config::{CompressionConfig, RetryConfig};
use crate::error::ToolStreamError;
use crate::event_bus::EventBus;
use crate::handlers::HandlerRegistry;
use crate::lifecycle::{FinishedToolCall, LifecycleContext, ToolCallLifecycle};
use crate::repair::{replace_tool_call, ClarifyingReask, RepairContext, RepairOutcome, ToolCallFailure, ToolCallRepairer};
use crate::retry::{backoff_for, detect_retryable_error, should_retry_without_healing, warrants_fallback};
use crate::storage::MessageEntryStore;

#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    /// Entries are persisted under this id; empty disables persistence.
    pub message_id: String,
    pub chat_id: String,
    pub provider_id: Option<String>,
    pub model: Option<String>,
    /// Named in healing messages so the model knows where it is.
    pub current_step: Option<String>,
    pub cancel: CancellationToken,
}

/// Everything read from one provider stream.
#[derive(Debug, Clone, Default)]
pub struct ConsumedStream {
    pub text: String,
    pub reasoning: String,
    pub finished: Vec<FinishedToolCall>,
    /// Calls that passed validation, in stream order.
    pub accepted: Vec<ToolCall>,
    pub failures: Vec<ToolCallFailure>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ConsumedStream {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.finished.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The conversation including the final assistant message.
    pub messages: Vec<ConversationMessage>,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    /// Failures no strategy could fix.
    pub unresolved: Vec<ToolCallFailure>,
    /// Provider streams opened for this turn.
    pub attempts: u32,
    pub usage: Option<TokenUsage>,
}

/// Streams one model turn through the tool-call lifecycle, then validates,
/// repairs and retries until the turn settles.
#[derive(Clone)]
pub struct ToolStreamRunner {
    providers: ProviderRegistry,
    catalog: ToolCatalog,
    store: Arc<dyn MessageEntryStore>,
    bus: EventBus,
    handlers: HandlerRegistry,
    repairer: ToolCallRepairer,
    retry: RetryConfig,
    compression: CompressionConfig,
}

impl ToolStreamRunner {
    pub fn new(providers: ProviderRegistry, catalog: ToolCatalog, store: Arc<dyn MessageEntryStore>) -> Self {
        Self {
            providers,
            catalog,
            store,
            bus: EventBus::new(),
            handlers: HandlerRegistry::with_defaults(),
            repairer: ToolCallRepairer::with_defaults(),
            retry: RetryConfig::default(),
            compression: CompressionConfig::default(),
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_repairer(mut self, repairer: ToolCallRepairer) -> Self {
        self.repairer = repairer;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn MessageEntryStore> {
        &self.store
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Reads chunks until `Done`, the end of the stream or cancellation,
    /// driving every tool call through the lifecycle. Calls still open at the
    /// end are finished from their accumulated text. When the stream breaks
    /// off or is cancelled, open calls are persisted as failed before the
    /// error is returned.
    pub async fn consume(&self, mut stream: ChunkStream, ctx: &TurnContext) -> anyhow::Result<ConsumedStream> {
        let mut lifecycle = ToolCallLifecycle::new(
            LifecycleContext::new(&ctx.message_id, &ctx.chat_id),
            self.handlers.clone(),
            self.store.clone(),
            self.bus.clone(),
        );
        let mut consumed = ConsumedStream::default();

        let interrupted: Option<anyhow::Error> = loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::info!(message_id = %ctx.message_id, "stream cancelled");
                    break Some(ToolStreamError::Cancelled.into());
                }
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break None,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => break Some(err),
            };
            let routed = match chunk {
                StreamChunk::TextDelta { text } => {
                    consumed.text.push_str(&text);
                    Ok(())
                }
                StreamChunk::ReasoningDelta { text } => {
                    consumed.reasoning.push_str(&text);
                    Ok(())
                }
                StreamChunk::ToolCallStart { id, name } => lifecycle.on_start(&id, &name).await.map(|_| ()),
                StreamChunk::ToolCallDelta { id, args_delta } => lifecycle.on_delta(&id, &args_delta).await.map(|_| ()),
                StreamChunk::ToolCallEnd { id, args } => lifecycle
                    .on_finish(&id, args)
                    .await
                    .map(|finished| consumed.finished.push(finished)),
                StreamChunk::Done { finish_reason, usage } => {
                    consumed.finish_reason = Some(finish_reason);
                    consumed.usage = usage;
                    break None;
                }
            };
            if let Err(err) = routed {
                break Some(err.into());
            }
        };

        if let Some(err) = interrupted {
            let reason = match err.downcast_ref::<ToolStreamError>() {
                Some(ToolStreamError::Cancelled) => "cancelled".to_string(),
                _ => format!("stream interrupted: {err}"),
            };
            match lifecycle.abort_open(&reason).await {
                Ok(aborted) if !aborted.is_empty() => {
                    tracing::warn!(message_id = %ctx.message_id, count = aborted.len(), "open tool calls marked failed");
                }
                Ok(_) => {}
                Err(abort_err) => {
                    tracing::warn!(message_id = %ctx.message_id, error = %abort_err, "could not fail open tool calls");
                }
            }
            if let Err(flush_err) = self.store.flush().await {
                tracing::warn!(message_id = %ctx.message_id, error = %flush_err, "flush after interrupted stream failed");
            }
            return Err(err);
        }

        consumed.finished.extend(lifecycle.finish_open().await?);

        for finished in &consumed.finished {
            if let Some(parse_error) = &finished.parse_error {
                consumed
                    .failures
                    .push(ToolCallFailure::unparseable(finished.call.clone(), parse_error));
                continue;
            }
            match self.catalog.validate_call(&finished.call).await {
                Ok(()) => consumed.accepted.push(finished.call.clone()),
                Err(err) => consumed
                    .failures
                    .push(ToolCallFailure::from_validation(finished.call.clone(), err)),
            }
        }
        self.store.flush().await?;
        Ok(consumed)
    }

    /// Runs one assistant turn: streams, repairs rejected calls, and re-asks
    /// the model when a repair needs it. Retryable provider errors are retried
    /// with backoff, moving to the next configured fallback provider when the
    /// failure is the provider's own. Reasks, retries and fallbacks share the
    /// `max_retries` budget.
    pub async fn run_turn(&self, messages: Vec<ConversationMessage>, ctx: &TurnContext) -> anyhow::Result<TurnOutcome> {
        let chain = self.providers.fallback_chain(ctx.provider_id.as_deref()).await?;
        let mut conversation = messages;
        let mut retries = 0u32;
        let mut attempts = 0u32;
        let mut provider_index = 0usize;

        loop {
            attempts += 1;
            let provider = chain[provider_index].clone();
            let provider_id = provider.info().id;

            if should_compress_history(&conversation, &self.compression) {
                let before = conversation.len();
                conversation = compress_history(&conversation, &self.compression);
                if conversation.len() < before {
                    let detail = format!("{before} -> {} messages", conversation.len());
                    self.log(Level::INFO, "turn.compressed", ctx, &provider_id, attempts, None, Some(&detail));
                    self.bus.emit(
                        "turn.compressed",
                        json!({
                            "messageID": ctx.message_id,
                            "chatID": ctx.chat_id,
                            "before": before,
                            "after": conversation.len(),
                        }),
                    );
                }
            }

            let consumed = match self.stream_once(provider.as_ref(), &conversation, ctx).await {
                Ok(consumed) if consumed.is_empty() => Err(ToolStreamError::EmptyTurn.into()),
                other => other,
            };
            let consumed = match consumed {
                Ok(consumed) => consumed,
                Err(err) => {
                    let Some(retryable) = detect_retryable_error(&err, ctx.current_step.as_deref()) else {
                        return Err(err);
                    };
                    if retries >= self.retry.max_retries {
                        return Err(err.context(format!("giving up after {retries} retries")));
                    }
                    let delay = backoff_for(&self.retry, retries);
                    retries += 1;
                    let detail = retryable.message.clone();
                    if !should_retry_without_healing(retryable.kind) {
                        conversation.push(retryable.healing_message);
                    }
                    if chain.len() > 1 && warrants_fallback(retryable.kind) {
                        provider_index = (provider_index + 1) % chain.len();
                        let next_id = chain[provider_index].info().id;
                        let detail = format!("{detail}; switching to {next_id}");
                        self.log(Level::WARN, "turn.fallback", ctx, &provider_id, attempts, Some(retryable.kind.as_str()), Some(&detail));
                        self.bus.emit(
                            "turn.fallback",
                            json!({
                                "messageID": ctx.message_id,
                                "chatID": ctx.chat_id,
                                "from": provider_id,
                                "to": next_id,
                                "reason": retryable.kind.as_str(),
                            }),
                        );
                        continue;
                    }
                    self.log(Level::WARN, "turn.retry", ctx, &provider_id, attempts, Some(retryable.kind.as_str()), Some(&detail));
                    sleep_or_cancel(delay, &ctx.cancel).await?;
                    continue;
                }
            };

            let assistant_index = conversation.len();
            conversation.push(assistant_message(&consumed));

            let mut accepted = consumed.accepted.clone();
            let mut unresolved = Vec::new();
            let mut reasked = Vec::new();
            for failure in consumed.failures {
                let outcome = {
                    let repair_ctx = RepairContext {
                        messages: &conversation,
                        catalog: &self.catalog,
                        provider: provider.clone(),
                        model: ctx.model.as_deref(),
                        current_step: ctx.current_step.as_deref(),
                    };
                    self.repairer.repair(failure.clone(), &repair_ctx).await
                };
                match outcome {
                    RepairOutcome::Repaired(call) => {
                        replace_tool_call(&mut conversation[assistant_index], &call);
                        accepted.push(call);
                    }
                    RepairOutcome::Reask(healed) => {
                        conversation = healed;
                        reasked.push(failure);
                    }
                    RepairOutcome::GaveUp(_) => unresolved.push(failure),
                }
            }

            if !reasked.is_empty() {
                if retries >= self.retry.max_retries {
                    unresolved.extend(reasked);
                } else {
                    retries += 1;
                    for call in &accepted {
                        let skipped = ConversationMessage::tool_result(
                            &call.id,
                            &call.name,
                            json!({
                                "status": "skipped",
                                "reason": "another tool call in this turn needs correction first",
                            }),
                        );
                        conversation = ClarifyingReask::insert_healing_message(&conversation, call, skipped);
                    }
                    self.log(Level::INFO, "turn.reask", ctx, &provider_id, attempts, None, None);
                    self.bus.emit(
                        "turn.reask",
                        json!({
                            "messageID": ctx.message_id,
                            "chatID": ctx.chat_id,
                            "attempt": attempts,
                            "toolCallIDs": reasked.iter().map(|f| f.call().id.clone()).collect::<Vec<_>>(),
                        }),
                    );
                    continue;
                }
            }

            self.log(Level::INFO, "turn.completed", ctx, &provider_id, attempts, None, None);
            self.bus.emit(
                "turn.completed",
                json!({
                    "messageID": ctx.message_id,
                    "chatID": ctx.chat_id,
                    "attempts": attempts,
                    "toolCalls": accepted.len(),
                    "unresolved": unresolved.len(),
                }),
            );
            return Ok(TurnOutcome {
                messages: conversation,
                text: consumed.text,
                tool_calls: accepted,
                unresolved,
                attempts,
                usage: consumed.usage,
            });
        }
    }

    async fn stream_once(
        &self,
        provider: &dyn Provider,
        conversation: &[ConversationMessage],
        ctx: &TurnContext,
    ) -> anyhow::Result<ConsumedStream> {
        let tools = self.catalog.list().await;
        let tools = (!tools.is_empty()).then_some(tools);
        let stream = provider
            .stream(
                ChatMessage::from_conversation(conversation),
                ctx.model.as_deref(),
                tools,
                ctx.cancel.clone(),
            )
            .await?;
        self.consume(stream, ctx).await
    }

    #[allow(clippy::too_many_arguments)]
    fn log(
        &self,
        level: Level,
        event: &str,
        ctx: &TurnContext,
        provider_id: &str,
        attempt: u32,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                message_id: Some(ctx.message_id.as_str()),
                chat_id: Some(ctx.chat_id.as_str()),
                provider_id: Some(provider_id),
                attempt: Some(attempt),
                error_code,
                detail,
                ..ObservabilityEvent::new("runner", event)
            },
        );
    }
}

fn assistant_message(consumed: &ConsumedStream) -> ConversationMessage {
    let mut content = Vec::new();
    if !consumed.text.is_empty() {
        content.push(ContentPart::Text {
            text: consumed.text.clone(),
        });
    }
    for finished in &consumed.finished {
        content.push(ContentPart::ToolCall {
            tool_call_id: finished.call.id.clone(),
            tool_name: finished.call.name.clone(),
            args: finished.call.args.clone(),
        });
    }
    ConversationMessage {
        role: MessageRole::Assistant,
        content,
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), ToolStreamError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ToolStreamError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
