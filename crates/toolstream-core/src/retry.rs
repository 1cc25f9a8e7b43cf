use std::time::Duration;

use serde::{Deserialize, Serialize};

use toolstream_json::JsonError;
use toolstream_providers::ProviderError;
use toolstream_types::ConversationMessage;

use crate::config::RetryConfig;
use crate::error::ToolStreamError;
use crate::repair::{ClarifyingReask, ToolCallFailure};

const BASE_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RetryableErrorKind {
    NoSuchTool,
    InvalidToolArguments,
    RateLimit,
    ServerError,
    NetworkTimeout,
    EmptyResponse,
    JsonParseError,
    Unknown,
}

impl RetryableErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryableErrorKind::NoSuchTool => "no-such-tool",
            RetryableErrorKind::InvalidToolArguments => "invalid-tool-arguments",
            RetryableErrorKind::RateLimit => "rate-limit",
            RetryableErrorKind::ServerError => "server-error",
            RetryableErrorKind::NetworkTimeout => "network-timeout",
            RetryableErrorKind::EmptyResponse => "empty-response",
            RetryableErrorKind::JsonParseError => "json-parse-error",
            RetryableErrorKind::Unknown => "unknown-error",
        }
    }
}

/// A failure worth another attempt, with the message to add to the
/// conversation before retrying.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryableError {
    pub kind: RetryableErrorKind,
    pub message: String,
    pub healing_message: ConversationMessage,
}

impl RetryableError {
    fn new(kind: RetryableErrorKind, message: String, healing: impl Into<String>) -> Self {
        Self {
            kind,
            message,
            healing_message: ConversationMessage::user(healing),
        }
    }
}

/// Classifies an error by walking its source chain. `None` means retrying
/// will not help (bad configuration, client errors, cancellation).
pub fn detect_retryable_error(err: &anyhow::Error, current_step: Option<&str>) -> Option<RetryableError> {
    let message = extract_detailed_error_message(err);
    for cause in err.chain() {
        if let Some(provider) = cause.downcast_ref::<ProviderError>() {
            return classify_provider_error(provider, message);
        }
        if let Some(stream) = cause.downcast_ref::<ToolStreamError>() {
            match stream {
                ToolStreamError::Rejected { call, reason } => {
                    let failure = ToolCallFailure::from_validation(call.clone(), reason.clone());
                    let kind = match failure {
                        ToolCallFailure::NoSuchTool { .. } => RetryableErrorKind::NoSuchTool,
                        ToolCallFailure::InvalidInput { .. } => RetryableErrorKind::InvalidToolArguments,
                    };
                    return Some(RetryableError {
                        kind,
                        message,
                        healing_message: ClarifyingReask::healing_message(&failure, current_step),
                    });
                }
                ToolStreamError::EmptyTurn => {
                    return Some(RetryableError::new(
                        RetryableErrorKind::EmptyResponse,
                        message,
                        "Please continue.",
                    ))
                }
                ToolStreamError::Cancelled => return None,
                _ => {}
            }
        }
        if cause.downcast_ref::<JsonError>().is_some() {
            return Some(RetryableError::new(
                RetryableErrorKind::JsonParseError,
                message,
                "There was an issue with the response format. Please try again with proper formatting.",
            ));
        }
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("rate limit") || lowered.contains("too many requests") {
        Some(RetryableError::new(
            RetryableErrorKind::RateLimit,
            message,
            "Rate limit reached, please wait and try again.",
        ))
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        Some(RetryableError::new(
            RetryableErrorKind::NetworkTimeout,
            message,
            "Connection timeout, please retry.",
        ))
    } else if lowered.contains("no tool calls generated") {
        Some(RetryableError::new(RetryableErrorKind::EmptyResponse, message, "Please continue."))
    } else {
        None
    }
}

fn classify_provider_error(err: &ProviderError, message: String) -> Option<RetryableError> {
    let (kind, healing) = match err {
        ProviderError::Status { status: 429, .. } => (
            RetryableErrorKind::RateLimit,
            "Rate limit reached, please wait and try again.",
        ),
        ProviderError::Status { status, .. } if (500..600).contains(status) => (
            RetryableErrorKind::ServerError,
            "Server temporarily unavailable, retrying...",
        ),
        ProviderError::Timeout(_) | ProviderError::Connection(_) => (
            RetryableErrorKind::NetworkTimeout,
            "Connection timeout, please retry.",
        ),
        ProviderError::EmptyResponse { .. } => (RetryableErrorKind::EmptyResponse, "Please continue."),
        ProviderError::MalformedPayload(_) => (
            RetryableErrorKind::JsonParseError,
            "There was an issue with the response format. Please try again with proper formatting.",
        ),
        ProviderError::Status { .. }
        | ProviderError::NotConfigured { .. }
        | ProviderError::NoneConfigured
        | ProviderError::Api(_) => return None,
    };
    Some(RetryableError::new(kind, message, healing))
}

/// Kinds where the request itself was fine and should be sent again as-is.
pub fn should_retry_without_healing(kind: RetryableErrorKind) -> bool {
    matches!(
        kind,
        RetryableErrorKind::RateLimit
            | RetryableErrorKind::ServerError
            | RetryableErrorKind::NetworkTimeout
            | RetryableErrorKind::EmptyResponse
    )
}

/// Kinds where another provider may succeed where this one failed.
pub fn warrants_fallback(kind: RetryableErrorKind) -> bool {
    matches!(
        kind,
        RetryableErrorKind::RateLimit | RetryableErrorKind::ServerError | RetryableErrorKind::NetworkTimeout
    )
}

/// `min(1s * 2^retry_count, max)`.
pub fn calculate_backoff_delay(retry_count: u32, max: Duration) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor)).min(max)
}

pub fn backoff_for(config: &RetryConfig, retry_count: u32) -> Duration {
    if config.exponential_backoff {
        calculate_backoff_delay(retry_count, config.max_backoff())
    } else {
        Duration::from_millis(BASE_BACKOFF_MS).min(config.max_backoff())
    }
}

/// The error and its causes on one line, skipping causes whose text is
/// already part of an outer message.
pub fn extract_detailed_error_message(err: &anyhow::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if text.is_empty() || parts.iter().any(|part| part.contains(&text)) {
            continue;
        }
        parts.push(text);
    }
    parts.join(" - ")
}

/// User-role message asking the model to carry on around an error nothing
/// more specific is known about.
pub fn generic_healing_message(err: &anyhow::Error) -> ConversationMessage {
    ConversationMessage::user(format!(
        "I encountered an error while processing your request: \"{}\". Please continue, \
         working around this issue if possible. If this is a tool-related error, use only \
         the tools available for the current step.",
        extract_detailed_error_message(err)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use serde_json::json;
    use toolstream_tools::CallValidationError;
    use toolstream_types::{MessageRole, ToolCall};

    #[test]
    fn provider_statuses_map_to_kinds() {
        let rate = anyhow::Error::new(ProviderError::Status {
            status: 429,
            detail: "slow down".to_string(),
        });
        assert_eq!(
            detect_retryable_error(&rate, None).map(|e| e.kind),
            Some(RetryableErrorKind::RateLimit)
        );

        let server = anyhow::Error::new(ProviderError::Status {
            status: 503,
            detail: "unavailable".to_string(),
        })
        .context("streaming turn");
        assert_eq!(
            detect_retryable_error(&server, None).map(|e| e.kind),
            Some(RetryableErrorKind::ServerError)
        );

        let client = anyhow::Error::new(ProviderError::Status {
            status: 401,
            detail: "bad key".to_string(),
        });
        assert!(detect_retryable_error(&client, None).is_none());
        assert!(warrants_fallback(RetryableErrorKind::ServerError));
        assert!(!warrants_fallback(RetryableErrorKind::EmptyResponse));
    }

    #[test]
    fn rejected_call_heals_with_tool_result() {
        let err = anyhow::Error::new(ToolStreamError::Rejected {
            call: ToolCall::new("c1", "lookup", json!({})),
            reason: CallValidationError::UnknownTool {
                name: "lookup".to_string(),
                available: vec!["done".to_string()],
            },
        });
        let retryable = detect_retryable_error(&err, Some("analysis")).expect("retryable");
        assert_eq!(retryable.kind, RetryableErrorKind::NoSuchTool);
        assert_eq!(retryable.healing_message.role, MessageRole::Tool);
        assert!(retryable.healing_message.has_tool_result_for("c1"));
        assert!(!should_retry_without_healing(retryable.kind));
        assert!(!warrants_fallback(retryable.kind));
    }

    #[test]
    fn empty_turn_and_cancellation() {
        let empty = anyhow::Error::new(ToolStreamError::EmptyTurn);
        let retryable = detect_retryable_error(&empty, None).expect("retryable");
        assert_eq!(retryable.kind, RetryableErrorKind::EmptyResponse);
        assert_eq!(retryable.healing_message.plain_text(), "Please continue.");

        let cancelled = anyhow::Error::new(ToolStreamError::Cancelled);
        assert!(detect_retryable_error(&cancelled, None).is_none());
    }

    #[test]
    fn message_heuristics_catch_untyped_errors() {
        let err = anyhow::anyhow!("upstream said: Rate limit exceeded");
        assert_eq!(
            detect_retryable_error(&err, None).map(|e| e.kind),
            Some(RetryableErrorKind::RateLimit)
        );
        assert!(detect_retryable_error(&anyhow::anyhow!("disk full"), None).is_none());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let max = Duration::from_millis(8000);
        assert_eq!(calculate_backoff_delay(0, max), Duration::from_millis(1000));
        assert_eq!(calculate_backoff_delay(2, max), Duration::from_millis(4000));
        assert_eq!(calculate_backoff_delay(5, max), max);
        assert_eq!(calculate_backoff_delay(200, max), max);

        let flat = RetryConfig {
            exponential_backoff: false,
            ..RetryConfig::default()
        };
        assert_eq!(backoff_for(&flat, 4), Duration::from_millis(1000));
    }

    #[test]
    fn detailed_message_joins_chain_without_repeats() {
        let err: anyhow::Result<()> = Err(anyhow::Error::new(ProviderError::Timeout("30s".to_string())));
        let err = err.context("opening stream").expect_err("error");
        assert_eq!(
            extract_detailed_error_message(&err),
            "opening stream - provider request timed out: 30s"
        );
        assert!(generic_healing_message(&err).plain_text().contains("opening stream"));
    }
}
