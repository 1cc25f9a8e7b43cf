use serde_json::Value;

use crate::scanner::{scan_document, Completion};
use crate::values::ExtractedValues;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptimisticParseResult {
    /// Best-effort document built from the text seen so far.
    pub parsed: Option<Value>,
    /// True only when the whole text is strictly valid JSON.
    pub is_complete: bool,
    /// True when the scan stopped on a syntax error rather than end of input.
    pub malformed: bool,
    pub extracted_values: ExtractedValues,
}

impl OptimisticParseResult {
    fn from_document(parsed: Option<Value>, is_complete: bool, malformed: bool) -> Self {
        let extracted_values = parsed
            .as_ref()
            .map(ExtractedValues::from_document)
            .unwrap_or_default();
        Self {
            parsed,
            is_complete,
            malformed,
            extracted_values,
        }
    }

    /// Strict JSON rendering of the partial document, with every open string,
    /// array and object closed.
    pub fn repaired_json(&self) -> Option<String> {
        self.parsed.as_ref().map(Value::to_string)
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.extracted_values.get(path)
    }
}

pub struct OptimisticJsonParser;

impl OptimisticJsonParser {
    pub fn parse(text: &str) -> OptimisticParseResult {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return OptimisticParseResult::default();
        }
        if let Ok(document) = serde_json::from_str::<Value>(trimmed) {
            return OptimisticParseResult::from_document(Some(document), true, false);
        }
        let scanned = scan_document(trimmed);
        OptimisticParseResult::from_document(
            scanned.value,
            false,
            scanned.completion == Completion::Malformed,
        )
    }

    /// Whether the text would still become valid JSON if more input arrived.
    pub fn is_viable_prefix(text: &str) -> bool {
        let trimmed = text.trim();
        trimmed.is_empty()
            || serde_json::from_str::<Value>(trimmed).is_ok()
            || scan_document(trimmed).completion == Completion::Truncated
    }
}
