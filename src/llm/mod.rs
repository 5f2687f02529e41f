mod openai;
pub mod stream;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;

pub use openai::{OpenAiCompatBackend, OpenAiCompatConfig};
pub use stream::{AggregatedResponse, StreamAggregator, ToolCallPayload};

/// One role-tagged message of the model's input context.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCallPayload>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn role(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::User(_) => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Text content of the message, if any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::System(content) | Self::User(content) => Some(content),
            Self::Assistant { content, .. } => content.as_deref(),
            Self::Tool { content, .. } => Some(content),
        }
    }
}

/// Declaration of an invocable function sent alongside a request.
#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// How the model is constrained to answer.
#[derive(Clone, Debug)]
pub enum ResponsePayload {
    /// Structured output: the response body must conform to the named schema.
    StructuredOutput { name: String, schema: Value },
    /// Classic tool calling with an explicit choice policy.
    Tools {
        definitions: Vec<ToolDefinition>,
        choice: ToolChoicePolicy,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolChoicePolicy {
    /// The model must call some tool.
    Required,
    /// The model must call this specific tool.
    Named(String),
}

/// A fully prepared outbound completion request.
///
/// `extra_body` carries backend-specific attributes decided by
/// [`crate::provider::ProviderKind::extra_body`]; its keys are merged into
/// the top level of the serialized request.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub payload: ResponsePayload,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub extra_body: Value,
    pub stream_usage: bool,
}

/// Seam between the agent loop and a concrete LLM backend.
///
/// The production implementation is [`OpenAiCompatBackend`]; tests install a
/// queued-response mock.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<AggregatedResponse, ProviderError>;

    /// Base endpoint this backend talks to, used for provider classification.
    fn base_url(&self) -> &str;
}
