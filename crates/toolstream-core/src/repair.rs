use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::Level;

use toolstream_json::{extract_first_json_object, strip_code_fence, OptimisticJsonParser};
use toolstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use toolstream_providers::Provider;
use toolstream_tools::{ArgumentError, CallValidationError, ToolCatalog, ToolResolution};
use toolstream_types::{ContentPart, ConversationMessage, MessageRole, ToolCall};

use crate::config::RepairConfig;

/// A tool call that cannot be dispatched as the model produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallFailure {
    InvalidInput {
        call: ToolCall,
        errors: Vec<ArgumentError>,
    },
    NoSuchTool {
        call: ToolCall,
        available: Vec<String>,
    },
}

impl ToolCallFailure {
    pub fn call(&self) -> &ToolCall {
        match self {
            ToolCallFailure::InvalidInput { call, .. } | ToolCallFailure::NoSuchTool { call, .. } => call,
        }
    }

    pub fn from_validation(call: ToolCall, error: CallValidationError) -> Self {
        match error {
            CallValidationError::UnknownTool { available, .. } => ToolCallFailure::NoSuchTool { call, available },
            CallValidationError::InvalidArguments { errors, .. } => ToolCallFailure::InvalidInput { call, errors },
        }
    }

    /// Arguments that never became a JSON document.
    pub fn unparseable(call: ToolCall, parse_error: &str) -> Self {
        ToolCallFailure::InvalidInput {
            call,
            errors: vec![ArgumentError {
                path: String::new(),
                message: format!("arguments are not valid JSON: {parse_error}"),
            }],
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ToolCallFailure::InvalidInput { .. } => "invalid_input",
            ToolCallFailure::NoSuchTool { .. } => "no_such_tool",
        }
    }

    /// Text shown to the model when it is asked to try again.
    pub fn healing_text(&self, current_step: Option<&str>) -> String {
        match self {
            ToolCallFailure::NoSuchTool { call, available } => {
                let mut text = format!(
                    "Tool \"{}\" is not available. Available tools: {}.",
                    call.name,
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                );
                if let Some(step) = current_step {
                    text.push_str(&format!(" You are currently in the {step} step."));
                }
                text.push_str(" Call one of the available tools instead.");
                text
            }
            ToolCallFailure::InvalidInput { call, errors } => {
                let mut text = format!("Invalid arguments for tool \"{}\":", call.name);
                for error in errors {
                    text.push_str(&format!("\n- {error}"));
                }
                text.push_str(&format!(
                    "\nCall \"{}\" again with arguments that match its schema.",
                    call.name
                ));
                text
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// A corrected call that passes validation.
    Repaired(ToolCall),
    /// The conversation with a healing message in place; stream again.
    Reask(Vec<ConversationMessage>),
    GaveUp(String),
}

pub struct RepairContext<'a> {
    pub messages: &'a [ConversationMessage],
    pub catalog: &'a ToolCatalog,
    pub provider: Arc<dyn Provider>,
    pub model: Option<&'a str>,
    pub current_step: Option<&'a str>,
}

#[async_trait]
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies_to(&self, failure: &ToolCallFailure) -> bool;
    async fn repair(&self, failure: &ToolCallFailure, ctx: &RepairContext<'_>) -> anyhow::Result<RepairOutcome>;
}

/// Renames a call whose tool name differs from exactly one registered tool
/// only by case, separators or camelCase.
pub struct ToolNameCorrection;

#[async_trait]
impl RepairStrategy for ToolNameCorrection {
    fn name(&self) -> &'static str {
        "tool_name_correction"
    }

    fn applies_to(&self, failure: &ToolCallFailure) -> bool {
        matches!(failure, ToolCallFailure::NoSuchTool { .. })
    }

    async fn repair(&self, failure: &ToolCallFailure, ctx: &RepairContext<'_>) -> anyhow::Result<RepairOutcome> {
        let call = failure.call();
        Ok(match ctx.catalog.resolve(&call.name).await {
            ToolResolution::Exact(name) | ToolResolution::Normalized(name) => {
                RepairOutcome::Repaired(ToolCall::new(&call.id, name, call.args.clone()))
            }
            ToolResolution::Ambiguous(candidates) => RepairOutcome::GaveUp(format!(
                "`{}` matches several tools: {}",
                call.name,
                candidates.join(", ")
            )),
            ToolResolution::Unknown => RepairOutcome::GaveUp(format!("no tool resembles `{}`", call.name)),
        })
    }
}

/// Asks the model for fresh arguments against the tool's schema and keeps
/// them only if they validate.
pub struct SchemaGuidedRegeneration;

impl SchemaGuidedRegeneration {
    fn prompt(call: &ToolCall, description: &str, schema: &Value, errors: &[ArgumentError], messages: &[ConversationMessage]) -> String {
        let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        let errors_text = errors
            .iter()
            .map(|error| format!("- {error}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = format!(
            "The arguments for tool `{name}` do not match its schema.\n\n\
             Tool description: {description}\n\n\
             JSON schema:\n{schema_text}\n\n\
             Arguments that failed validation:\n{args}\n\n\
             Validation errors:\n{errors_text}\n\n",
            name = call.name,
            args = call.args,
        );
        let last_user = messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(ConversationMessage::plain_text);
        if let Some(request) = last_user.filter(|text| !text.trim().is_empty()) {
            prompt.push_str(&format!("The user asked:\n{request}\n\n"));
        }
        prompt.push_str(&format!(
            "Reply with only a JSON object containing corrected arguments for `{}`.",
            call.name
        ));
        prompt
    }
}

/// Pulls an argument object out of a model reply that may wrap it in a code
/// fence or prose, or cut it off early.
pub fn parse_regenerated_args(reply: &str) -> Option<Value> {
    let body = strip_code_fence(reply);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    if let Some(candidate) = extract_first_json_object(body) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
    }
    let start = body.find('{')?;
    OptimisticJsonParser::parse(&body[start..])
        .parsed
        .filter(Value::is_object)
}

#[async_trait]
impl RepairStrategy for SchemaGuidedRegeneration {
    fn name(&self) -> &'static str {
        "schema_guided_regeneration"
    }

    fn applies_to(&self, failure: &ToolCallFailure) -> bool {
        matches!(failure, ToolCallFailure::InvalidInput { .. })
    }

    async fn repair(&self, failure: &ToolCallFailure, ctx: &RepairContext<'_>) -> anyhow::Result<RepairOutcome> {
        let ToolCallFailure::InvalidInput { call, errors } = failure else {
            return Ok(RepairOutcome::GaveUp("not an argument failure".to_string()));
        };
        let Some(schema) = ctx.catalog.get(&call.name).await else {
            return Ok(RepairOutcome::GaveUp(format!("tool `{}` is not registered", call.name)));
        };

        let prompt = Self::prompt(call, &schema.description, &schema.input_schema, errors, ctx.messages);
        let reply = ctx
            .provider
            .complete(&prompt, ctx.model)
            .await
            .with_context(|| format!("regenerating arguments for `{}`", call.name))?;
        let Some(args) = parse_regenerated_args(&reply) else {
            return Ok(RepairOutcome::GaveUp("model reply contained no JSON object".to_string()));
        };
        match ctx.catalog.validate_arguments(&call.name, &args).await {
            Ok(()) => Ok(RepairOutcome::Repaired(ToolCall::new(&call.id, &call.name, args))),
            Err(err) => Ok(RepairOutcome::GaveUp(format!("regenerated arguments still invalid: {err}"))),
        }
    }
}

/// Answers the failed call with an error result so the model can try again
/// with the problem spelled out.
pub struct ClarifyingReask;

impl ClarifyingReask {
    pub fn healing_message(failure: &ToolCallFailure, current_step: Option<&str>) -> ConversationMessage {
        let call = failure.call();
        ConversationMessage::tool_result(
            &call.id,
            &call.name,
            json!({ "error": failure.healing_text(current_step) }),
        )
    }

    /// Places `healing` right after the assistant message that holds the
    /// unanswered call, matched by id first and then by name. A match by name
    /// re-targets the healing result at the orphaned call's id. Appends when
    /// no such message exists.
    pub fn insert_healing_message(
        messages: &[ConversationMessage],
        call: &ToolCall,
        mut healing: ConversationMessage,
    ) -> Vec<ConversationMessage> {
        let unanswered = |index: usize, id: &str| {
            !messages[index + 1..]
                .iter()
                .any(|later| later.has_tool_result_for(id))
        };
        let orphan = |matches: &dyn Fn(&str, &str) -> bool| {
            messages.iter().enumerate().rev().find_map(|(index, message)| {
                if message.role != MessageRole::Assistant {
                    return None;
                }
                message
                    .tool_calls()
                    .find(|&(id, name)| matches(id, name) && unanswered(index, id))
                    .map(|(id, _)| (index, id.to_string()))
            })
        };
        let position = orphan(&|id, _| id == call.id).or_else(|| orphan(&|_, name| name == call.name));

        let mut out = messages.to_vec();
        match position {
            Some((index, orphan_id)) => {
                for part in &mut healing.content {
                    if let ContentPart::ToolResult { tool_call_id, .. } = part {
                        *tool_call_id = orphan_id.clone();
                    }
                }
                out.insert(index + 1, healing);
            }
            None => out.push(healing),
        }
        out
    }
}

#[async_trait]
impl RepairStrategy for ClarifyingReask {
    fn name(&self) -> &'static str {
        "clarifying_reask"
    }

    fn applies_to(&self, _failure: &ToolCallFailure) -> bool {
        true
    }

    async fn repair(&self, failure: &ToolCallFailure, ctx: &RepairContext<'_>) -> anyhow::Result<RepairOutcome> {
        let healing = Self::healing_message(failure, ctx.current_step);
        Ok(RepairOutcome::Reask(Self::insert_healing_message(
            ctx.messages,
            failure.call(),
            healing,
        )))
    }
}

pub fn strategy_by_name(name: &str) -> Option<Arc<dyn RepairStrategy>> {
    match name {
        "tool_name_correction" => Some(Arc::new(ToolNameCorrection)),
        "schema_guided_regeneration" => Some(Arc::new(SchemaGuidedRegeneration)),
        "clarifying_reask" => Some(Arc::new(ClarifyingReask)),
        _ => None,
    }
}

/// Runs strategies in order until one produces something other than
/// `GaveUp`. A repaired call is validated again; if it still fails, the new
/// failure starts over from the first strategy. Strategy invocations are
/// capped at `max_attempts` per failure.
#[derive(Clone)]
pub struct ToolCallRepairer {
    strategies: Vec<Arc<dyn RepairStrategy>>,
    max_attempts: usize,
}

impl ToolCallRepairer {
    pub fn new(strategies: Vec<Arc<dyn RepairStrategy>>, max_attempts: usize) -> Self {
        Self {
            strategies,
            max_attempts,
        }
    }

    pub fn with_defaults() -> Self {
        Self::from_config(&RepairConfig::default())
    }

    pub fn from_config(config: &RepairConfig) -> Self {
        let strategies = config
            .strategies
            .iter()
            .filter_map(|name| {
                let strategy = strategy_by_name(name);
                if strategy.is_none() {
                    tracing::warn!(strategy = %name, "unknown repair strategy ignored");
                }
                strategy
            })
            .collect();
        Self::new(strategies, config.max_attempts)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn repair(&self, failure: ToolCallFailure, ctx: &RepairContext<'_>) -> RepairOutcome {
        let mut current = failure;
        let mut attempts = 0usize;
        let mut last_reason = None;
        let mut index = 0usize;

        while index < self.strategies.len() {
            let strategy = &self.strategies[index];
            index += 1;
            if !strategy.applies_to(&current) {
                continue;
            }
            if attempts >= self.max_attempts {
                last_reason = Some(format!("gave up after {attempts} repair attempts"));
                break;
            }
            attempts += 1;
            log_attempt(Level::INFO, "repair.attempt", &current, strategy.name(), attempts, None);

            match strategy.repair(&current, ctx).await {
                Ok(RepairOutcome::Repaired(call)) => match ctx.catalog.validate_call(&call).await {
                    Ok(()) => {
                        log_attempt(Level::INFO, "repair.repaired", &current, strategy.name(), attempts, None);
                        return RepairOutcome::Repaired(call);
                    }
                    Err(err) => {
                        current = ToolCallFailure::from_validation(call, err);
                        index = 0;
                    }
                },
                Ok(RepairOutcome::Reask(messages)) => {
                    log_attempt(Level::INFO, "repair.reask", &current, strategy.name(), attempts, None);
                    return RepairOutcome::Reask(messages);
                }
                Ok(RepairOutcome::GaveUp(reason)) => {
                    log_attempt(Level::DEBUG, "repair.skipped", &current, strategy.name(), attempts, Some(&reason));
                    last_reason = Some(reason);
                }
                Err(err) => {
                    let detail = format!("{err:#}");
                    log_attempt(Level::WARN, "repair.failed", &current, strategy.name(), attempts, Some(&detail));
                    last_reason = Some(detail);
                }
            }
        }

        let reason = last_reason.unwrap_or_else(|| format!("no repair strategy applies to {}", current.code()));
        log_attempt(Level::WARN, "repair.gave_up", &current, "", attempts, Some(&reason));
        RepairOutcome::GaveUp(reason)
    }
}

impl Default for ToolCallRepairer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn log_attempt(level: Level, event: &str, failure: &ToolCallFailure, strategy: &str, attempt: usize, detail: Option<&str>) {
    let call = failure.call();
    emit_event(
        level,
        ProcessKind::Engine,
        ObservabilityEvent {
            tool_call_id: Some(call.id.as_str()),
            tool_name: Some(call.name.as_str()),
            attempt: Some(u32::try_from(attempt).unwrap_or(u32::MAX)),
            status: Some(strategy),
            error_code: Some(failure.code()),
            detail,
            ..ObservabilityEvent::new("repair", event)
        },
    );
}

/// Rewrites the tool-call part with the repaired call's id. Returns false when
/// `message` holds no such call.
pub fn replace_tool_call(message: &mut ConversationMessage, repaired: &ToolCall) -> bool {
    for part in &mut message.content {
        if let ContentPart::ToolCall {
            tool_call_id,
            tool_name,
            args,
        } = part
        {
            if *tool_call_id == repaired.id {
                tool_name.clone_from(&repaired.name);
                *args = repaired.args.clone();
                return true;
            }
        }
    }
    false
}
