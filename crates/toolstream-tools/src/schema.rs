use serde_json::Value;

use toolstream_types::ToolSchema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Structural checks that providers are known to reject even when the schema
/// is valid JSON Schema.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_tool_schema(schema)?;
    }
    Ok(())
}

pub fn validate_tool_schema(schema: &ToolSchema) -> Result<(), ToolSchemaValidationError> {
    let fail = |path: &str, reason: &str| ToolSchemaValidationError {
        tool_name: schema.name.clone(),
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if schema.name.trim().is_empty() {
        return Err(fail("$", "tool name is empty"));
    }
    match schema.input_schema.get("type").and_then(Value::as_str) {
        Some("object") | None => {}
        Some(_) => return Err(fail("$", "root schema must describe an object")),
    }
    check_node(&schema.input_schema, "$", &fail)
}

fn check_node<F>(node: &Value, path: &str, fail: &F) -> Result<(), ToolSchemaValidationError>
where
    F: Fn(&str, &str) -> ToolSchemaValidationError,
{
    let Some(obj) = node.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(Value::as_str) == Some("array") && !obj.contains_key("items") {
        return Err(fail(path, "array schema missing items"));
    }

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        let properties = obj.get("properties").and_then(Value::as_object);
        for name in required.iter().filter_map(Value::as_str) {
            if !properties.is_some_and(|props| props.contains_key(name)) {
                return Err(fail(path, &format!("required property `{name}` is not declared")));
            }
        }
    }

    if let Some(items) = obj.get("items") {
        check_node(items, &format!("{path}.items"), fail)?;
    }
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (key, child) in props {
            check_node(child, &format!("{path}.properties.{key}"), fail)?;
        }
    }
    if let Some(additional) = obj.get("additionalProperties") {
        check_node(additional, &format!("{path}.additionalProperties"), fail)?;
    }
    for keyword in ["oneOf", "anyOf", "allOf"] {
        if let Some(variants) = obj.get(keyword).and_then(Value::as_array) {
            for (idx, child) in variants.iter().enumerate() {
                check_node(child, &format!("{path}.{keyword}[{idx}]"), fail)?;
            }
        }
    }
    Ok(())
}
