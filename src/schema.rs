//! Structured-output contract construction.
//!
//! Models frequently misattribute fields when candidate tool schemas share
//! optional field names, so every candidate is derived into a variant with an
//! injected required literal discriminant before the variants are combined
//! into a tagged union. The discriminant is stripped again when the chosen
//! action is decoded, so it never leaks into tool inputs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::SchemaError;
use crate::tools::ToolSpec;

/// Injected literal field that disambiguates which variant a structured
/// output instance belongs to.
pub const DISCRIMINANT_FIELD: &str = "tool_name";

/// Field of the combined next-step schema that carries the chosen action.
pub const ACTION_FIELD: &str = "function";

/// One step's self-reported chain-of-thought, produced once per iteration
/// and immutable once logged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRecord {
    pub reasoning_steps: Vec<String>,
    pub current_situation: String,
    pub plan_status: String,
    #[serde(default)]
    pub enough_data: bool,
    pub remaining_steps: Vec<String>,
    pub task_completed: bool,
}

impl ReasoningRecord {
    pub fn parse(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Short description of the upcoming step, used as assistant content
    /// when the chosen action is appended to the conversation.
    pub fn next_step(&self) -> &str {
        self.remaining_steps
            .first()
            .map(String::as_str)
            .unwrap_or("Completing")
    }
}

/// Schema for [`ReasoningRecord`], used standalone by the two-call agent
/// variant and embedded by [`next_step_schema`].
pub fn reasoning_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reasoning_steps": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 1,
                "maxItems": 10,
                "description": "Step-by-step reasoning, one brief sentence each"
            },
            "current_situation": {
                "type": "string",
                "maxLength": 1000,
                "description": "Current situation, 2-3 sentences max"
            },
            "plan_status": {
                "type": "string",
                "maxLength": 500,
                "description": "Status of the current plan, one sentence"
            },
            "enough_data": {
                "type": "boolean",
                "description": "Sufficient data collected for a comprehensive answer?"
            },
            "remaining_steps": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 1,
                "maxItems": 10,
                "description": "Remaining steps, brief and action-oriented"
            },
            "task_completed": {
                "type": "boolean",
                "description": "Is the task finished?"
            }
        },
        "required": [
            "reasoning_steps",
            "current_situation",
            "plan_status",
            "enough_data",
            "remaining_steps",
            "task_completed"
        ],
        "additionalProperties": false
    })
}

/// Derives a variant schema: the tool's own fields plus the required
/// discriminant whose only legal value is the tool's name.
pub fn discriminant_variant(tool: &ToolSpec) -> Value {
    let mut schema = tool.parameters().clone();
    let object = schema
        .as_object_mut()
        .expect("tool parameters validated as object at registration");

    object
        .entry("description")
        .or_insert_with(|| Value::String(tool.description().to_string()));

    let properties = object
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(properties) = properties.as_object_mut() {
        properties.insert(
            DISCRIMINANT_FIELD.to_string(),
            json!({
                "type": "string",
                "const": tool.name(),
                "description": "Tool name discriminator"
            }),
        );
    }

    let required = object
        .entry("required")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(required) = required.as_array_mut() {
        required.insert(0, Value::String(DISCRIMINANT_FIELD.to_string()));
    }

    schema
}

/// Tagged union over the candidate set. A union of one candidate adds
/// parsing ambiguity without benefit, so N=1 yields the variant directly.
pub fn tool_union(tools: &[ToolSpec]) -> Value {
    if tools.len() == 1 {
        return discriminant_variant(&tools[0]);
    }
    json!({
        "anyOf": tools.iter().map(discriminant_variant).collect::<Vec<_>>()
    })
}

/// Combined single-call schema: the reasoning record plus a required
/// action field holding the tool union, so one model call returns both the
/// chain-of-thought and the chosen action atomically.
pub fn next_step_schema(tools: &[ToolSpec]) -> Value {
    let mut schema = reasoning_schema();
    let object = schema
        .as_object_mut()
        .expect("reasoning schema is an object");

    if let Some(properties) = object.get_mut("properties").and_then(Value::as_object_mut) {
        properties.insert(ACTION_FIELD.to_string(), tool_union(tools));
    }
    if let Some(required) = object.get_mut("required").and_then(Value::as_array_mut) {
        required.push(Value::String(ACTION_FIELD.to_string()));
    }

    schema
}

const CONSTRAINT_KEYWORDS: [&str; 11] = [
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minItems",
    "maxItems",
    "multipleOf",
];

/// Recursively removes JSON-Schema constraint keywords that strict backend
/// schema compilers reject (see
/// [`crate::provider::ProviderKind::strict_schema_compiler`]).
pub fn strip_constraint_keywords(schema: &mut Value) {
    match schema {
        Value::Object(object) => {
            for keyword in CONSTRAINT_KEYWORDS {
                object.remove(keyword);
            }
            for value in object.values_mut() {
                strip_constraint_keywords(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_constraint_keywords(item);
            }
        }
        _ => {}
    }
}

/// Reads the discriminant out of a structured action and returns the tool
/// name together with the argument object, discriminant stripped.
pub fn decode_action(action: &Value) -> Result<(String, Value), SchemaError> {
    let object = action
        .as_object()
        .ok_or_else(|| SchemaError::ActionNotObject(action.to_string()))?;

    let name = object
        .get(DISCRIMINANT_FIELD)
        .and_then(Value::as_str)
        .ok_or(SchemaError::MissingDiscriminant(DISCRIMINANT_FIELD))?
        .to_string();

    let mut args = object.clone();
    args.remove(DISCRIMINANT_FIELD);
    Ok((name, Value::Object(args)))
}
