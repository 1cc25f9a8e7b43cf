use serde_json::Value;

use crate::error::{JsonError, Result};
use crate::optimistic::{OptimisticJsonParser, OptimisticParseResult};

/// What a single push changed in the optimistic view.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseUpdate {
    pub result: OptimisticParseResult,
    /// Paths that were not present before this push.
    pub added: Vec<String>,
    /// Paths whose value differs from the previous push.
    pub changed: Vec<String>,
}

impl ParseUpdate {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }
}

/// Accumulates the argument text of one streamed tool call.
#[derive(Debug, Clone, Default)]
pub struct StreamingJsonAccumulator {
    buffer: String,
    latest: OptimisticParseResult,
}

impl StreamingJsonAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) -> ParseUpdate {
        self.buffer.push_str(delta);
        let result = OptimisticJsonParser::parse(&self.buffer);

        let mut added = Vec::new();
        let mut changed = Vec::new();
        for (path, value) in result.extracted_values.iter() {
            match self.latest.extracted_values.get(path) {
                None => added.push(path.to_string()),
                Some(previous) if previous != value => changed.push(path.to_string()),
                Some(_) => {}
            }
        }
        tracing::trace!(
            bytes = self.buffer.len(),
            added = added.len(),
            changed = changed.len(),
            complete = result.is_complete,
            "optimistic parse"
        );

        self.latest = result.clone();
        ParseUpdate {
            result,
            added,
            changed,
        }
    }

    /// Replaces everything received so far with `text`, as when a provider
    /// sends authoritative arguments at the end of a stream.
    pub fn reset(&mut self, text: &str) -> ParseUpdate {
        self.buffer.clear();
        self.push(text)
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn latest(&self) -> &OptimisticParseResult {
        &self.latest
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// Strict parse of everything received. Empty text means `{}`.
    pub fn finish(&self) -> Result<Value> {
        let trimmed = self.buffer.trim();
        if trimmed.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(trimmed).map_err(|err| {
            if err.is_eof() {
                JsonError::Incomplete {
                    received: self.buffer.len(),
                }
            } else {
                JsonError::Invalid(err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_reports_added_and_changed_paths() {
        let mut acc = StreamingJsonAccumulator::new();

        let update = acc.push(r#"{"final_response": "Hel"#);
        assert_eq!(update.added, vec!["final_response"]);
        assert!(update.changed.is_empty());

        let update = acc.push(r#"lo", "#);
        assert!(update.added.is_empty());
        assert_eq!(update.changed, vec!["final_response"]);

        let update = acc.push(r#""cou"#);
        assert!(update.is_noop());

        let update = acc.push(r#"nt": 2}"#);
        assert_eq!(update.added, vec!["count"]);
        assert!(update.result.is_complete);
        assert_eq!(acc.finish().unwrap(), json!({"final_response": "Hello", "count": 2}));
    }

    #[test]
    fn reset_replaces_the_draft() {
        let mut acc = StreamingJsonAccumulator::new();
        acc.push(r#"{"final_response": "draf"#);
        let update = acc.reset(r#"{"final_response":"final answer"}"#);
        assert_eq!(update.changed, vec!["final_response"]);
        assert_eq!(acc.text(), r#"{"final_response":"final answer"}"#);
        assert_eq!(acc.finish().unwrap(), json!({"final_response": "final answer"}));
    }

    #[test]
    fn finish_on_empty_text_is_empty_object() {
        let acc = StreamingJsonAccumulator::new();
        assert!(acc.is_empty());
        assert_eq!(acc.finish().unwrap(), json!({}));
    }

    #[test]
    fn finish_distinguishes_incomplete_from_invalid() {
        let mut acc = StreamingJsonAccumulator::new();
        acc.push(r#"{"a": "b"#);
        assert!(matches!(acc.finish(), Err(JsonError::Incomplete { .. })));

        let mut acc = StreamingJsonAccumulator::new();
        acc.push(r#"{"a" "b"}"#);
        assert!(matches!(acc.finish(), Err(JsonError::Invalid(_))));
    }
}
