use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::JSONSchema;
use thiserror::Error;
use tokio::sync::RwLock;

use toolstream_types::{ToolCall, ToolSchema};

mod args;
mod names;
mod schema;

pub use args::ArgumentError;
pub use names::{normalize_tool_name, resolve_tool_name, ToolResolution};
pub use schema::{validate_tool_schema, validate_tool_schemas, ToolSchemaValidationError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    InvalidSchema(#[from] ToolSchemaValidationError),
    #[error("tool `{tool_name}` schema does not compile: {reason}")]
    SchemaCompile { tool_name: String, reason: String },
}

/// Why a tool call cannot be dispatched as-is.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallValidationError {
    #[error("unknown tool `{name}`")]
    UnknownTool { name: String, available: Vec<String> },
    #[error("invalid arguments for `{name}`: {}", format_errors(.errors))]
    InvalidArguments {
        name: String,
        errors: Vec<ArgumentError>,
    },
}

fn format_errors(errors: &[ArgumentError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

struct CatalogEntry {
    schema: ToolSchema,
    compiled: Arc<JSONSchema>,
}

/// Tools the model may call, with their compiled argument schemas.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: Arc<RwLock<HashMap<String, Arc<CatalogEntry>>>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_schemas(schemas: Vec<ToolSchema>) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        for schema in schemas {
            catalog.register(schema).await?;
        }
        Ok(catalog)
    }

    pub async fn register(&self, schema: ToolSchema) -> Result<(), CatalogError> {
        validate_tool_schema(&schema)?;
        let compiled = args::compile(&schema.input_schema).map_err(|reason| CatalogError::SchemaCompile {
            tool_name: schema.name.clone(),
            reason,
        })?;
        tracing::debug!(tool = %schema.name, "tool registered");
        self.tools.write().await.insert(
            schema.name.clone(),
            Arc::new(CatalogEntry {
                schema,
                compiled: Arc::new(compiled),
            }),
        );
        Ok(())
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|entry| entry.schema.clone())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names = self.tools.read().await.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub async fn get(&self, name: &str) -> Option<ToolSchema> {
        self.tools.read().await.get(name).map(|entry| entry.schema.clone())
    }

    pub async fn resolve(&self, requested: &str) -> ToolResolution {
        let tools = self.tools.read().await;
        let mut names = tools.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        resolve_tool_name(requested, names)
    }

    pub async fn validate_arguments(&self, name: &str, args: &serde_json::Value) -> Result<(), CallValidationError> {
        let entry = self.tools.read().await.get(name).cloned();
        let Some(entry) = entry else {
            return Err(CallValidationError::UnknownTool {
                name: name.to_string(),
                available: self.names().await,
            });
        };
        let errors = args::collect_errors(&entry.compiled, args);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CallValidationError::InvalidArguments {
                name: name.to_string(),
                errors,
            })
        }
    }

    pub async fn validate_call(&self, call: &ToolCall) -> Result<(), CallValidationError> {
        self.validate_arguments(&call.name, &call.args).await
    }
}
