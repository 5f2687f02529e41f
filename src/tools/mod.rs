pub mod system;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::{SchemaError, ToolError};

/// Terminal status a final-answer-capable tool may assign to the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    Completed,
    Failed,
    Error,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// What a tool execution produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    /// A textual observation fed back to the model.
    Observation(String),
    /// Terminal answer: the run ends with this status.
    Final { answer: String, status: FinalStatus },
    /// The agent needs external input before continuing.
    Clarify { questions: Vec<String> },
}

/// Read-only snapshot of run state handed to a tool at execution time.
/// Tools resolve relative paths against `working_directory`.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub working_directory: PathBuf,
    pub iteration: u32,
    pub searches_used: u32,
    pub clarifications_used: u32,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("."),
            iteration: 0,
            searches_used: 0,
            clarifications_used: 0,
        }
    }
}

type ToolHandler =
    dyn Fn(Value, ToolContext) -> BoxFuture<'static, Result<ToolOutcome, ToolError>> + Send + Sync;

/// A named, schema-described unit of action.
///
/// Variants are declared once at process start; the state machine picks
/// transient candidate subsets per step. The `finalizes` flag marks variants
/// that may terminate the run, `search` marks ones billed against the search
/// budget.
#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    parameters: Value,
    finalizes: bool,
    search: bool,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .field("finalizes", &self.finalizes)
            .field("search", &self.search)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": false,
            }),
            finalizes: false,
            search: false,
            handler: Arc::new(|_args, _context| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_schema(&schema)?;
        self.parameters = schema;
        Ok(self)
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutcome, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, context| Box::pin(handler(args, context)));
        self
    }

    /// Marks the variant as final-answer-capable.
    pub fn finalizing(mut self) -> Self {
        self.finalizes = true;
        self
    }

    /// Marks the variant as counting against the search budget.
    pub fn searching(mut self) -> Self {
        self.search = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn finalizes(&self) -> bool {
        self.finalizes
    }

    pub fn is_search(&self) -> bool {
        self.search
    }

    /// Validates arguments against the declared schema, then runs the
    /// handler. A handler failure comes back as `Err`; the state machine
    /// turns it into an error observation rather than aborting the loop.
    pub async fn execute(
        &self,
        args: Value,
        context: ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        validate_arguments(&self.name, &self.parameters, &args)?;
        (self.handler)(args, context).await
    }
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let object = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    match object.get("type").and_then(Value::as_str) {
        Some("object") => {}
        _ => return Err(SchemaError::RootTypeMustBeObject),
    }

    if let Some(required) = object.get("required") {
        let entries = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        if entries.iter().any(|entry| !entry.is_string()) {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

fn validate_arguments(tool_name: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message,
    };

    let args_object = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;
    let schema_object = schema
        .as_object()
        .ok_or_else(|| invalid("tool schema must be a JSON object".to_string()))?;

    if let Some(required) = schema_object.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args_object.contains_key(field) {
                return Err(invalid(format!("missing required field: {field}")));
            }
        }
    }

    let properties = schema_object
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let allow_unknown = schema_object
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    for (key, value) in args_object {
        let Some(field_schema) = properties.get(key) else {
            if !allow_unknown {
                return Err(invalid(format!("unknown field: {key}")));
            }
            continue;
        };
        if let Some(expected) = field_schema.get("type").and_then(Value::as_str) {
            if !value_matches_type(value, expected) {
                return Err(invalid(format!("field '{key}' must be of type {expected}")));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
