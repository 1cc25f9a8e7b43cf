use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use toolstream_json::{get_optimistic_value, normalize_escaped_text, ExtractedValues};
use toolstream_tools::normalize_tool_name;
use toolstream_types::EntryKind;

use crate::lifecycle::ToolCallPhase;

/// What a handler sees of a tool call when projecting it.
pub struct ProjectionInput<'a> {
    pub tool_call_id: &'a str,
    pub tool_name: &'a str,
    pub phase: ToolCallPhase,
    pub values: &'a ExtractedValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryProjection {
    pub kind: EntryKind,
    pub title: String,
    pub content: Value,
}

/// Turns the optimistic view of a tool call's arguments into the entry shown
/// for it. Called on every transition, so it must be cheap and pure.
pub trait ToolStreamHandler: Send + Sync {
    fn project(&self, input: &ProjectionInput<'_>) -> EntryProjection;
}

/// Tools whose argument text is the answer shown to the user.
pub struct ResponseToolHandler;

impl ToolStreamHandler for ResponseToolHandler {
    fn project(&self, input: &ProjectionInput<'_>) -> EntryProjection {
        let message = input
            .values
            .get_str("final_response")
            .or_else(|| input.values.get_str("message"))
            .unwrap_or_default();
        EntryProjection {
            kind: EntryKind::Response,
            title: "Response".to_string(),
            content: json!({ "message": message }),
        }
    }
}

/// Reasoning tools. `sequential_thinking` streams a `thought` and says whether
/// another one follows; `submit_thoughts` streams `thoughts`.
pub struct ThoughtToolHandler;

impl ToolStreamHandler for ThoughtToolHandler {
    fn project(&self, input: &ProjectionInput<'_>) -> EntryProjection {
        let raw = input
            .values
            .get_str("thought")
            .or_else(|| input.values.get_str("thoughts"))
            .unwrap_or_default();
        let finished_reasoning = match get_optimistic_value::<bool>(input.values, "nextThoughtNeeded") {
            Some(next_needed) => !next_needed,
            None => input.phase == ToolCallPhase::Complete,
        };
        let mut content = json!({
            "text": normalize_escaped_text(raw),
            "finished_reasoning": finished_reasoning,
        });
        if let Some(number) = get_optimistic_value::<u64>(input.values, "thoughtNumber") {
            content["thought_number"] = json!(number);
        }
        let title = if input.phase == ToolCallPhase::Complete {
            "Thought"
        } else {
            "Thinking"
        };
        EntryProjection {
            kind: EntryKind::Reasoning,
            title: title.to_string(),
            content,
        }
    }
}

/// Tools that stream a `files` array of `{name, yml_content}` objects. A file
/// is listed once both fields have started arriving.
pub struct FilesToolHandler;

impl FilesToolHandler {
    fn file_id(tool_call_id: &str, index: usize) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{tool_call_id}/{index}").as_bytes()).to_string()
    }

    fn title(tool_name: &str, count: usize) -> String {
        let normalized = normalize_tool_name(tool_name);
        let (verb, noun) = normalized.split_once('_').unwrap_or((normalized.as_str(), "files"));
        let verb = match verb {
            "create" => "Creating",
            "modify" => "Modifying",
            "update" => "Updating",
            other => other,
        };
        let noun = noun.replace('_', " ");
        if count == 0 {
            format!("{verb} {noun}")
        } else {
            format!("{verb} {noun} ({count})")
        }
    }
}

impl ToolStreamHandler for FilesToolHandler {
    fn project(&self, input: &ProjectionInput<'_>) -> EntryProjection {
        let status = if input.phase == ToolCallPhase::Complete {
            "completed"
        } else {
            "loading"
        };
        let files = input
            .values
            .get("files")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter_map(|(index, file)| {
                let name = file.get("name")?.as_str()?;
                let yml_content = file.get("yml_content")?.as_str()?;
                Some(json!({
                    "id": Self::file_id(input.tool_call_id, index),
                    "name": name,
                    "yml_content": yml_content,
                    "status": status,
                }))
            })
            .collect::<Vec<_>>();
        EntryProjection {
            kind: EntryKind::Reasoning,
            title: Self::title(input.tool_name, files.len()),
            content: json!({ "files": files }),
        }
    }
}

/// Fallback: shows the raw extracted values under the tool's name.
pub struct GenericToolHandler;

impl ToolStreamHandler for GenericToolHandler {
    fn project(&self, input: &ProjectionInput<'_>) -> EntryProjection {
        EntryProjection {
            kind: EntryKind::Reasoning,
            title: input.tool_name.to_string(),
            content: json!({ "values": input.values }),
        }
    }
}

#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ToolStreamHandler>>,
    fallback: Arc<dyn ToolStreamHandler>,
}

impl HandlerRegistry {
    /// Only the generic fallback.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(GenericToolHandler),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let response: Arc<dyn ToolStreamHandler> = Arc::new(ResponseToolHandler);
        let thought: Arc<dyn ToolStreamHandler> = Arc::new(ThoughtToolHandler);
        let files: Arc<dyn ToolStreamHandler> = Arc::new(FilesToolHandler);
        for name in ["done", "respond_without_analysis"] {
            registry.register(name, response.clone());
        }
        for name in ["sequential_thinking", "submit_thoughts"] {
            registry.register(name, thought.clone());
        }
        for name in ["create_metrics", "create_dashboards", "modify_metrics", "modify_dashboards"] {
            registry.register(name, files.clone());
        }
        registry
    }

    pub fn register(&mut self, tool_name: &str, handler: Arc<dyn ToolStreamHandler>) {
        self.handlers.insert(normalize_tool_name(tool_name), handler);
    }

    pub fn handler_for(&self, tool_name: &str) -> &Arc<dyn ToolStreamHandler> {
        self.handlers
            .get(&normalize_tool_name(tool_name))
            .unwrap_or(&self.fallback)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
