use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        result: Value,
    },
}

/// One turn of a model conversation, with structured tool-call content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
}

impl ConversationMessage {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    pub fn assistant_tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: vec![ContentPart::ToolCall {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
                args,
            }],
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: vec![ContentPart::ToolResult {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
                result,
            }],
        }
    }

    /// `(tool_call_id, tool_name)` for every tool call in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str)> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall {
                tool_call_id,
                tool_name,
                ..
            } => Some((tool_call_id.as_str(), tool_name.as_str())),
            _ => None,
        })
    }

    pub fn has_tool_result_for(&self, tool_call_id: &str) -> bool {
        self.content.iter().any(|part| {
            matches!(part, ContentPart::ToolResult { tool_call_id: id, .. } if id == tool_call_id)
        })
    }

    /// Flattened text used by providers that only accept plain string content.
    pub fn plain_text(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ToolCall {
                    tool_name, args, ..
                } => format!("[tool call {tool_name}] {args}"),
                ContentPart::ToolResult {
                    tool_name, result, ..
                } => format!("[tool result {tool_name}] {result}"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_parts_use_tagged_wire_names() {
        let msg = ConversationMessage::tool_result("call-1", "grep", json!({"error": "x"}));
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["role"], "tool");
        assert_eq!(value["content"][0]["type"], "tool-result");
        assert_eq!(value["content"][0]["toolCallId"], "call-1");
        assert!(msg.has_tool_result_for("call-1"));
        assert!(!msg.has_tool_result_for("call-2"));
    }

    #[test]
    fn tool_calls_lists_ids_and_names() {
        let msg = ConversationMessage::assistant_tool_call("c1", "list_files", json!({}));
        let calls = msg.tool_calls().collect::<Vec<_>>();
        assert_eq!(calls, vec![("c1", "list_files")]);
    }
}
