//! Size-triggered trimming of conversation history before a provider request.

use toolstream_types::{ContentPart, ConversationMessage, MessageRole};

use crate::config::CompressionConfig;

/// Rough token count: about four characters per token.
pub fn estimate_tokens(messages: &[ConversationMessage]) -> usize {
    messages
        .iter()
        .flat_map(|message| message.content.iter())
        .map(|part| match part {
            ContentPart::Text { text } => text.len() / 4,
            ContentPart::ToolCall { args, .. } => args.to_string().len() / 4,
            ContentPart::ToolResult { result, .. } => result.to_string().len() / 4,
        })
        .sum()
}

pub fn should_compress_history(messages: &[ConversationMessage], config: &CompressionConfig) -> bool {
    if !config.enabled {
        return false;
    }
    messages.len() > config.message_threshold || estimate_tokens(messages) > config.token_threshold
}

/// Keeps the leading system messages, the first user request and the last
/// `keep_recent` messages, replacing everything in between with one note.
/// The kept tail never opens with a tool result whose call was dropped.
pub fn compress_history(messages: &[ConversationMessage], config: &CompressionConfig) -> Vec<ConversationMessage> {
    let mut head_end = messages
        .iter()
        .take_while(|message| message.role == MessageRole::System)
        .count();
    if messages.get(head_end).is_some_and(|message| message.role == MessageRole::User) {
        head_end += 1;
    }

    let mut tail_start = messages.len().saturating_sub(config.keep_recent).max(head_end);
    while tail_start < messages.len() && messages[tail_start].role == MessageRole::Tool {
        tail_start += 1;
    }
    if tail_start <= head_end {
        return messages.to_vec();
    }

    let dropped = tail_start - head_end;
    let mut out = Vec::with_capacity(head_end + 1 + messages.len() - tail_start);
    out.extend_from_slice(&messages[..head_end]);
    out.push(ConversationMessage::system(format!(
        "[{dropped} earlier messages were removed to keep the conversation within the context limit.]"
    )));
    out.extend_from_slice(&messages[tail_start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(message_threshold: usize, keep_recent: usize) -> CompressionConfig {
        CompressionConfig {
            message_threshold,
            keep_recent,
            ..CompressionConfig::default()
        }
    }

    fn long_conversation() -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::system("You are a data analyst."),
            ConversationMessage::user("why did revenue dip?"),
            ConversationMessage::assistant_tool_call("c1", "list_tables", json!({})),
            ConversationMessage::tool_result("c1", "list_tables", json!({"tables": ["orders"]})),
            ConversationMessage::assistant_tool_call("c2", "run_sql", json!({"sql": "select 1"})),
            ConversationMessage::tool_result("c2", "run_sql", json!({"rows": 1})),
            ConversationMessage::user("and by region?"),
        ]
    }

    #[test]
    fn thresholds_gate_compression() {
        let messages = long_conversation();
        assert!(should_compress_history(&messages, &config(5, 2)));
        assert!(!should_compress_history(&messages, &config(10, 2)));

        let disabled = CompressionConfig {
            enabled: false,
            ..config(1, 2)
        };
        assert!(!should_compress_history(&messages, &disabled));

        let by_tokens = CompressionConfig {
            token_threshold: 5,
            ..config(100, 2)
        };
        assert!(should_compress_history(&messages, &by_tokens));
    }

    #[test]
    fn keeps_head_and_recent_messages() {
        let messages = long_conversation();
        let compressed = compress_history(&messages, &config(5, 3));
        assert_eq!(compressed.len(), 6);
        assert_eq!(compressed[0], messages[0]);
        assert_eq!(compressed[1], messages[1]);
        assert_eq!(compressed[2].role, MessageRole::System);
        assert!(compressed[2].plain_text().contains("2 earlier messages"));
        assert_eq!(&compressed[3..], &messages[4..]);
    }

    #[test]
    fn tail_does_not_start_with_orphaned_tool_result() {
        let messages = long_conversation();
        let compressed = compress_history(&messages, &config(5, 2));
        assert_eq!(compressed.len(), 4);
        assert_eq!(compressed.last(), messages.last());
        assert!(compressed.iter().all(|m| m.role != MessageRole::Tool));
    }

    #[test]
    fn short_history_is_left_alone() {
        let messages = vec![ConversationMessage::user("hi")];
        assert_eq!(compress_history(&messages, &config(0, 4)), messages);
    }
}
