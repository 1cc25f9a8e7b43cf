use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One schema violation in a tool call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentError {
    /// JSON pointer into the arguments, `""` for the root.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} at {}", self.message, self.path)
        }
    }
}

pub(crate) fn compile(schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::compile(schema).map_err(|err| err.to_string())
}

pub(crate) fn collect_errors(compiled: &JSONSchema, args: &Value) -> Vec<ArgumentError> {
    match compiled.validate(args) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|err| ArgumentError {
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect(),
    }
}
