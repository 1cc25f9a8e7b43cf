use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::Level;

use toolstream_json::{ExtractedValues, StreamingJsonAccumulator};
use toolstream_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use toolstream_types::{EntryStatus, MessageEntry, ToolCall, UpdateReceipt};

use crate::error::ToolStreamError;
use crate::event_bus::EventBus;
use crate::handlers::{EntryProjection, HandlerRegistry, ProjectionInput};
use crate::storage::MessageEntryStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Opened,
    Streaming,
    Complete,
}

impl ToolCallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCallPhase::Opened => "opened",
            ToolCallPhase::Streaming => "streaming",
            ToolCallPhase::Complete => "complete",
        }
    }
}

/// Where snapshots go. An empty `message_id` disables persistence while the
/// state machine still advances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleContext {
    pub message_id: String,
    pub chat_id: String,
}

impl LifecycleContext {
    pub fn new(message_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            chat_id: chat_id.into(),
        }
    }

    fn persists(&self) -> bool {
        !self.message_id.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub tool_call_id: String,
    pub tool_name: String,
    pub phase: ToolCallPhase,
    /// Final arguments, set once the call completes.
    pub args: Option<Value>,
    pub last_parse_complete: bool,
    accumulator: StreamingJsonAccumulator,
    last_entry: Option<MessageEntry>,
}

impl ToolCallState {
    fn new(tool_call_id: &str, tool_name: &str) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            phase: ToolCallPhase::Opened,
            args: None,
            last_parse_complete: false,
            accumulator: StreamingJsonAccumulator::new(),
            last_entry: None,
        }
    }

    pub fn args_text(&self) -> &str {
        self.accumulator.text()
    }

    fn best_effort_args(&self) -> Value {
        self.accumulator.latest().parsed.clone().unwrap_or_else(|| json!({}))
    }

    /// The entry most recently projected for this call, persisted or not.
    pub fn last_entry(&self) -> Option<&MessageEntry> {
        self.last_entry.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinishedToolCall {
    pub call: ToolCall,
    pub status: EntryStatus,
    /// Why the call failed: argument text that is not valid JSON, or a
    /// stream that broke off before the call was closed.
    pub parse_error: Option<String>,
    pub receipt: Option<UpdateReceipt>,
}

/// Drives each streamed tool call of one assistant message from `Opened`
/// through `Streaming` to `Complete`, projecting and persisting a snapshot at
/// every transition.
pub struct ToolCallLifecycle {
    context: LifecycleContext,
    handlers: HandlerRegistry,
    store: Arc<dyn MessageEntryStore>,
    bus: EventBus,
    states: HashMap<String, ToolCallState>,
    order: Vec<String>,
}

impl ToolCallLifecycle {
    pub fn new(
        context: LifecycleContext,
        handlers: HandlerRegistry,
        store: Arc<dyn MessageEntryStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            context,
            handlers,
            store,
            bus,
            states: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn context(&self) -> &LifecycleContext {
        &self.context
    }

    pub async fn on_start(&mut self, tool_call_id: &str, tool_name: &str) -> Result<Option<UpdateReceipt>, ToolStreamError> {
        if self.states.contains_key(tool_call_id) {
            return Err(ToolStreamError::DuplicateStart(tool_call_id.to_string()));
        }
        let mut state = ToolCallState::new(tool_call_id, tool_name);
        let projection = project(
            &self.handlers,
            &state,
            state.phase,
            &state.accumulator.latest().extracted_values,
        );
        let receipt = persist(
            self.store.as_ref(),
            &self.context,
            &mut state,
            projection,
            EntryStatus::Loading,
            true,
        )
        .await?;

        self.publish("tool_call.started", &state, json!({}));
        self.log(Level::INFO, "tool_call.started", &state, None);
        self.order.push(tool_call_id.to_string());
        self.states.insert(tool_call_id.to_string(), state);
        Ok(receipt)
    }

    /// Returns the store receipt when the delta changed what the entry shows.
    pub async fn on_delta(&mut self, tool_call_id: &str, delta: &str) -> Result<Option<UpdateReceipt>, ToolStreamError> {
        let state = self
            .states
            .get_mut(tool_call_id)
            .ok_or_else(|| ToolStreamError::UnknownCall(tool_call_id.to_string()))?;
        if state.phase == ToolCallPhase::Complete {
            return Err(ToolStreamError::AlreadyFinished(tool_call_id.to_string()));
        }

        let update = state.accumulator.push(delta);
        state.phase = ToolCallPhase::Streaming;
        state.last_parse_complete = update.result.is_complete;
        let projection = project(&self.handlers, state, state.phase, &update.result.extracted_values);
        let receipt = persist(
            self.store.as_ref(),
            &self.context,
            state,
            projection,
            EntryStatus::Loading,
            false,
        )
        .await?;

        let state = &self.states[tool_call_id];
        self.publish(
            "tool_call.delta",
            state,
            json!({
                "added": update.added,
                "changed": update.changed,
                "complete": update.result.is_complete,
            }),
        );
        tracing::trace!(
            tool_call_id,
            delta_len = delta.len(),
            persisted = receipt.is_some(),
            "tool call delta"
        );
        Ok(receipt)
    }

    /// Closes the call. `final_args` from the provider win over the
    /// accumulated text; an empty text means `{}`.
    pub async fn on_finish(
        &mut self,
        tool_call_id: &str,
        final_args: Option<Value>,
    ) -> Result<FinishedToolCall, ToolStreamError> {
        self.close(tool_call_id, final_args, None).await
    }

    /// Finishes every call still open, in start order. Used when a stream ends
    /// without explicit end markers.
    pub async fn finish_open(&mut self) -> Result<Vec<FinishedToolCall>, ToolStreamError> {
        let mut finished = Vec::new();
        for id in self.open_ids() {
            finished.push(self.close(&id, None, None).await?);
        }
        Ok(finished)
    }

    /// Fails every call still open with `reason`, keeping whatever arguments
    /// had been parsed. Used when the stream breaks off or is cancelled.
    pub async fn abort_open(&mut self, reason: &str) -> Result<Vec<FinishedToolCall>, ToolStreamError> {
        let mut aborted = Vec::new();
        for id in self.open_ids() {
            aborted.push(self.close(&id, None, Some(reason.to_string())).await?);
        }
        Ok(aborted)
    }

    fn open_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.states
                    .get(id.as_str())
                    .is_some_and(|state| state.phase != ToolCallPhase::Complete)
            })
            .cloned()
            .collect()
    }

    async fn close(
        &mut self,
        tool_call_id: &str,
        final_args: Option<Value>,
        abort_reason: Option<String>,
    ) -> Result<FinishedToolCall, ToolStreamError> {
        let state = self
            .states
            .get_mut(tool_call_id)
            .ok_or_else(|| ToolStreamError::UnknownCall(tool_call_id.to_string()))?;
        if state.phase == ToolCallPhase::Complete {
            return Err(ToolStreamError::AlreadyFinished(tool_call_id.to_string()));
        }

        let (args, parse_error, from_provider) = match (final_args, abort_reason) {
            (_, Some(reason)) => (state.best_effort_args(), Some(reason), false),
            (Some(args), None) => (args, None, true),
            (None, None) => match state.accumulator.finish() {
                Ok(args) => (args, None, false),
                Err(err) => (state.best_effort_args(), Some(err.to_string()), false),
            },
        };
        let status = if parse_error.is_some() {
            EntryStatus::Failed
        } else {
            EntryStatus::Completed
        };

        let values = ExtractedValues::from_document(&args);
        let projection = project(&self.handlers, state, ToolCallPhase::Complete, &values);
        let receipt = persist(self.store.as_ref(), &self.context, state, projection, status, true).await?;

        if from_provider && state.accumulator.text().trim() != args.to_string() {
            state.accumulator.reset(&args.to_string());
        }
        state.phase = ToolCallPhase::Complete;
        state.last_parse_complete = parse_error.is_none();
        state.args = Some(args.clone());

        let state = &self.states[tool_call_id];
        let status_label = match status {
            EntryStatus::Failed => "failed",
            _ => "completed",
        };
        self.publish(
            "tool_call.finished",
            state,
            json!({ "status": status_label, "parseError": parse_error }),
        );
        match &parse_error {
            Some(err) => {
                let detail = format!("{err}; args {}", redact_text(state.args_text()));
                self.log(Level::WARN, "tool_call.finished", state, Some(&detail));
            }
            None => self.log(Level::INFO, "tool_call.finished", state, None),
        }

        Ok(FinishedToolCall {
            call: ToolCall::new(&state.tool_call_id, &state.tool_name, args),
            status,
            parse_error,
            receipt,
        })
    }

    pub fn snapshot(&self, tool_call_id: &str) -> Option<&ToolCallState> {
        self.states.get(tool_call_id)
    }

    /// All calls in start order.
    pub fn states(&self) -> Vec<&ToolCallState> {
        self.order
            .iter()
            .filter_map(|id| self.states.get(id))
            .collect()
    }

    fn publish(&self, event_type: &str, state: &ToolCallState, extra: Value) {
        let mut properties = json!({
            "messageID": self.context.message_id,
            "chatID": self.context.chat_id,
            "toolCallID": state.tool_call_id,
            "toolName": state.tool_name,
            "phase": state.phase.as_str(),
        });
        if let (Some(target), Value::Object(extra)) = (properties.as_object_mut(), extra) {
            target.extend(extra);
        }
        self.bus.emit(event_type, properties);
    }

    fn log(&self, level: Level, event: &str, state: &ToolCallState, detail: Option<&str>) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                message_id: Some(self.context.message_id.as_str()),
                chat_id: Some(self.context.chat_id.as_str()),
                tool_call_id: Some(state.tool_call_id.as_str()),
                tool_name: Some(state.tool_name.as_str()),
                status: Some(state.phase.as_str()),
                detail,
                ..ObservabilityEvent::new("lifecycle", event)
            },
        );
    }
}

fn project(
    handlers: &HandlerRegistry,
    state: &ToolCallState,
    phase: ToolCallPhase,
    values: &ExtractedValues,
) -> EntryProjection {
    handlers.handler_for(&state.tool_name).project(&ProjectionInput {
        tool_call_id: &state.tool_call_id,
        tool_name: &state.tool_name,
        phase,
        values,
    })
}

/// Writes the projected entry unless persistence is off, or `force` is false
/// and the entry would render the same as the last one.
async fn persist(
    store: &dyn MessageEntryStore,
    context: &LifecycleContext,
    state: &mut ToolCallState,
    projection: EntryProjection,
    status: EntryStatus,
    force: bool,
) -> Result<Option<UpdateReceipt>, ToolStreamError> {
    let entry = MessageEntry {
        id: state.tool_call_id.clone(),
        message_id: context.message_id.clone(),
        tool_call_id: state.tool_call_id.clone(),
        tool_name: state.tool_name.clone(),
        kind: projection.kind,
        status,
        title: projection.title,
        content: projection.content,
        sequence: 0,
        updated_at: Utc::now(),
    };
    let unchanged = state
        .last_entry
        .as_ref()
        .is_some_and(|last| last.same_payload(&entry));
    if !force && unchanged {
        return Ok(None);
    }
    let receipt = if context.persists() {
        Some(store.upsert(entry.clone()).await?)
    } else {
        None
    };
    state.last_entry = Some(entry);
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryEntryStore, StorageError};
    use toolstream_types::EntryKind;

    fn lifecycle(message_id: &str) -> (ToolCallLifecycle, Arc<MemoryEntryStore>, EventBus) {
        let store = Arc::new(MemoryEntryStore::new());
        let bus = EventBus::new();
        let lifecycle = ToolCallLifecycle::new(
            LifecycleContext::new(message_id, "chat-1"),
            HandlerRegistry::with_defaults(),
            store.clone(),
            bus.clone(),
        );
        (lifecycle, store, bus)
    }

    #[tokio::test]
    async fn start_delta_finish_persists_each_transition() {
        let (mut lifecycle, store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("call-1", "done").await.expect("start");
        let initial = store.entries("msg-1").await;
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].status, EntryStatus::Loading);
        assert_eq!(initial[0].kind, EntryKind::Response);

        lifecycle
            .on_delta("call-1", r#"{"final_response": "Hel"#)
            .await
            .expect("delta");
        lifecycle.on_delta("call-1", r#"lo"}"#).await.expect("delta");
        let finished = lifecycle.on_finish("call-1", None).await.expect("finish");

        assert_eq!(finished.status, EntryStatus::Completed);
        assert_eq!(finished.call.args, json!({"final_response": "Hello"}));
        let entries = store.entries("msg-1").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Completed);
        assert_eq!(entries[0].content, json!({"message": "Hello"}));
    }

    #[tokio::test]
    async fn deltas_that_do_not_change_the_entry_are_not_persisted() {
        let (mut lifecycle, _store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("call-1", "done").await.expect("start");
        let first = lifecycle.on_delta("call-1", "{").await.expect("delta");
        assert!(first.is_none());
        let second = lifecycle
            .on_delta("call-1", r#""final_response": "a""#)
            .await
            .expect("delta");
        assert!(second.is_some());
        let third = lifecycle.on_delta("call-1", " ").await.expect("delta");
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn empty_message_id_advances_without_persisting() {
        let (mut lifecycle, store, _bus) = lifecycle("");
        assert!(lifecycle.on_start("call-1", "done").await.expect("start").is_none());
        lifecycle.on_delta("call-1", r#"{"message": "x"}"#).await.expect("delta");
        let finished = lifecycle.on_finish("call-1", None).await.expect("finish");
        assert!(finished.receipt.is_none());
        assert!(store.entries("").await.is_empty());
        assert_eq!(
            lifecycle.snapshot("call-1").map(|s| s.phase),
            Some(ToolCallPhase::Complete)
        );
    }

    #[tokio::test]
    async fn invalid_transitions_are_errors() {
        let (mut lifecycle, _store, _bus) = lifecycle("msg-1");
        assert!(matches!(
            lifecycle.on_delta("missing", "{").await,
            Err(ToolStreamError::UnknownCall(_))
        ));
        lifecycle.on_start("call-1", "done").await.expect("start");
        assert!(matches!(
            lifecycle.on_start("call-1", "done").await,
            Err(ToolStreamError::DuplicateStart(_))
        ));
        lifecycle.on_finish("call-1", None).await.expect("finish");
        assert!(matches!(
            lifecycle.on_delta("call-1", "{").await,
            Err(ToolStreamError::AlreadyFinished(_))
        ));
        assert!(matches!(
            lifecycle.on_finish("call-1", None).await,
            Err(ToolStreamError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn empty_arguments_finish_as_empty_object() {
        let (mut lifecycle, _store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("call-1", "list_tables").await.expect("start");
        let finished = lifecycle.on_finish("call-1", None).await.expect("finish");
        assert_eq!(finished.call.args, json!({}));
        assert_eq!(finished.status, EntryStatus::Completed);
    }

    #[tokio::test]
    async fn truncated_arguments_finish_as_failed() {
        let (mut lifecycle, store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("call-1", "done").await.expect("start");
        lifecycle
            .on_delta("call-1", r#"{"final_response": "cut off"#)
            .await
            .expect("delta");
        let finished = lifecycle.on_finish("call-1", None).await.expect("finish");
        assert_eq!(finished.status, EntryStatus::Failed);
        assert!(finished.parse_error.is_some());
        assert_eq!(finished.call.args, json!({"final_response": "cut off"}));
        assert_eq!(store.entries("msg-1").await[0].status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn provider_arguments_win_and_feed_the_projection() {
        let (mut lifecycle, store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("call-1", "done").await.expect("start");
        let finished = lifecycle
            .on_finish("call-1", Some(json!({"final_response": "direct"})))
            .await
            .expect("finish");
        assert_eq!(finished.call.args["final_response"], "direct");
        assert_eq!(store.entries("msg-1").await[0].content["message"], "direct");
    }

    #[tokio::test]
    async fn provider_arguments_replace_a_streamed_draft() {
        let (mut lifecycle, store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("call-1", "done").await.expect("start");
        lifecycle
            .on_delta("call-1", r#"{"final_response": "draf"#)
            .await
            .expect("delta");
        assert_eq!(store.entries("msg-1").await[0].content["message"], "draf");

        let final_args = json!({"final_response": "final answer"});
        let finished = lifecycle
            .on_finish("call-1", Some(final_args.clone()))
            .await
            .expect("finish");
        assert_eq!(finished.status, EntryStatus::Completed);
        let entries = store.entries("msg-1").await;
        assert_eq!(entries[0].status, EntryStatus::Completed);
        assert_eq!(entries[0].content, json!({"message": "final answer"}));
        let state = lifecycle.snapshot("call-1").expect("state");
        assert_eq!(state.args_text(), final_args.to_string());
        assert_eq!(state.args, Some(final_args));
    }

    /// Accepts upserts until switched to failing.
    struct SwitchableStore {
        inner: MemoryEntryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl MessageEntryStore for SwitchableStore {
        async fn upsert(&self, entry: MessageEntry) -> Result<UpdateReceipt, StorageError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Write("disk full".to_string()));
            }
            self.inner.upsert(entry).await
        }

        async fn entries(&self, message_id: &str) -> Vec<MessageEntry> {
            self.inner.entries(message_id).await
        }

        async fn flush(&self) -> Result<(), StorageError> {
            self.inner.flush().await
        }

        async fn close(&self) -> Result<(), StorageError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn failed_final_write_leaves_the_call_open() {
        let store = Arc::new(SwitchableStore {
            inner: MemoryEntryStore::new(),
            failing: std::sync::atomic::AtomicBool::new(false),
        });
        let mut lifecycle = ToolCallLifecycle::new(
            LifecycleContext::new("msg-1", "chat-1"),
            HandlerRegistry::with_defaults(),
            store.clone(),
            EventBus::new(),
        );
        lifecycle.on_start("call-1", "done").await.expect("start");
        lifecycle
            .on_delta("call-1", r#"{"final_response": "ok"}"#)
            .await
            .expect("delta");

        store.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            lifecycle.on_finish("call-1", None).await,
            Err(ToolStreamError::Storage(_))
        ));
        let state = lifecycle.snapshot("call-1").expect("state");
        assert_ne!(state.phase, ToolCallPhase::Complete);
        assert!(state.args.is_none());

        store.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        let finished = lifecycle.on_finish("call-1", None).await.expect("retried finish");
        assert_eq!(finished.status, EntryStatus::Completed);
        assert_eq!(store.entries("msg-1").await[0].status, EntryStatus::Completed);
    }

    #[tokio::test]
    async fn abort_open_fails_unfinished_calls_with_partial_args() {
        let (mut lifecycle, store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("a", "done").await.expect("start");
        lifecycle.on_delta("a", r#"{"final_response": "x"}"#).await.expect("delta");
        lifecycle.on_finish("a", None).await.expect("finish");
        lifecycle.on_start("b", "done").await.expect("start");
        lifecycle
            .on_delta("b", r#"{"final_response": "half"#)
            .await
            .expect("delta");

        let aborted = lifecycle.abort_open("cancelled").await.expect("abort");
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].call.id, "b");
        assert_eq!(aborted[0].status, EntryStatus::Failed);
        assert_eq!(aborted[0].parse_error.as_deref(), Some("cancelled"));
        assert_eq!(aborted[0].call.args, json!({"final_response": "half"}));

        let entries = store.entries("msg-1").await;
        assert_eq!(entries[0].status, EntryStatus::Completed);
        assert_eq!(entries[1].status, EntryStatus::Failed);
        assert!(lifecycle.abort_open("cancelled").await.expect("abort").is_empty());
    }

    #[tokio::test]
    async fn events_carry_call_identity() {
        let (mut lifecycle, _store, bus) = lifecycle("msg-1");
        let mut rx = bus.subscribe();
        lifecycle.on_start("call-1", "done").await.expect("start");
        lifecycle.on_delta("call-1", "{}").await.expect("delta");
        lifecycle.on_finish("call-1", None).await.expect("finish");

        let started = rx.recv().await.expect("started");
        assert_eq!(started.event_type, "tool_call.started");
        assert_eq!(started.properties["messageID"], "msg-1");
        assert_eq!(started.properties["toolCallID"], "call-1");
        let delta = rx.recv().await.expect("delta");
        assert_eq!(delta.event_type, "tool_call.delta");
        let finished = rx.recv().await.expect("finished");
        assert_eq!(finished.event_type, "tool_call.finished");
        assert_eq!(finished.properties["status"], "completed");
    }

    #[tokio::test]
    async fn finish_open_closes_calls_in_start_order() {
        let (mut lifecycle, _store, _bus) = lifecycle("msg-1");
        lifecycle.on_start("b", "done").await.expect("start");
        lifecycle.on_start("a", "submit_thoughts").await.expect("start");
        lifecycle.on_finish("b", None).await.expect("finish");
        let finished = lifecycle.finish_open().await.expect("finish open");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].call.id, "a");
        let order = lifecycle
            .states()
            .iter()
            .map(|s| s.tool_call_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["b", "a"]);
    }
}
