use serde::Deserialize;
use serde_json::Value;

use crate::error::ProviderError;
use crate::usage::Usage;

/// One reassembled tool call with fully parsed arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One incremental fragment of a streamed chat completion.
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallDelta {
    pub index: Option<usize>,
    pub id: Option<String>,
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Terminal, non-incremental completion object. Some backends answer with
/// this even when streaming was requested.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    pub message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCall {
    pub id: Option<String>,
    pub function: WireToolCallFunction,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCallFunction {
    pub name: String,
    pub arguments: String,
}

/// Usage accounting as backends actually ship it: every field optional,
/// thinking tokens nested under completion details, cached tokens nested
/// under prompt details, monetary cost only on some backends.
#[derive(Debug, Default, Deserialize)]
pub struct WireUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub completion_tokens_details: Option<CompletionTokenDetails>,
    pub prompt_tokens_details: Option<PromptTokenDetails>,
    pub cost: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompletionTokenDetails {
    pub reasoning_tokens: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PromptTokenDetails {
    pub cached_tokens: Option<u64>,
}

impl WireUsage {
    /// Flattens the provider shape into [`Usage`]. When the reported total
    /// does not already include thinking tokens, adds them so throughput and
    /// cost math stay consistent across backends.
    pub fn normalize(self) -> Usage {
        let prompt_tokens = self.prompt_tokens.unwrap_or(0);
        let completion_tokens = self.completion_tokens.unwrap_or(0);
        let thinking_tokens = self
            .completion_tokens_details
            .and_then(|details| details.reasoning_tokens)
            .unwrap_or(0);
        let cached_tokens = self
            .prompt_tokens_details
            .and_then(|details| details.cached_tokens)
            .unwrap_or(0);

        let mut total_tokens = self
            .total_tokens
            .unwrap_or(prompt_tokens + completion_tokens);
        if thinking_tokens > 0 && total_tokens == prompt_tokens + completion_tokens {
            total_tokens += thinking_tokens;
        }

        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            thinking_tokens,
            cached_tokens,
            cost: self.cost,
            estimated: false,
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles an incremental completion stream into a coherent response.
///
/// Text deltas are concatenated; tool-call argument deltas are routed by
/// stream index (falling back to call id) so concurrently-opened calls are
/// never interleaved. Usage is remembered from the last fragment that
/// carried one, because some backends attach it only there.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    text: String,
    calls: Vec<PartialToolCall>,
    last_usage: Option<Usage>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: ChatChunk) {
        if let Some(usage) = chunk.usage {
            self.last_usage = Some(usage.normalize());
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                self.text.push_str(&content);
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let slot = self.slot_for(&delta);
                if let Some(id) = delta.id {
                    slot.id = Some(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        slot.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        slot.arguments.push_str(&arguments);
                    }
                }
            }
        }
    }

    fn slot_for(&mut self, delta: &ToolCallDelta) -> &mut PartialToolCall {
        if let Some(index) = delta.index {
            while self.calls.len() <= index {
                self.calls.push(PartialToolCall::default());
            }
            return &mut self.calls[index];
        }
        if let Some(id) = &delta.id {
            if let Some(position) = self
                .calls
                .iter()
                .position(|call| call.id.as_deref() == Some(id))
            {
                return &mut self.calls[position];
            }
        }
        self.calls.push(PartialToolCall::default());
        let last = self.calls.len() - 1;
        &mut self.calls[last]
    }

    /// Produces the final response, preferring usage from the terminal
    /// completion object over the last streamed fragment.
    pub fn finish(self, terminal_usage: Option<Usage>) -> AggregatedResponse {
        let tool_calls = self
            .calls
            .into_iter()
            .enumerate()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| ToolCallPayload {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            })
            .collect();

        AggregatedResponse {
            text: self.text,
            tool_calls,
            usage: terminal_usage.or(self.last_usage),
        }
    }
}

/// Lenient argument parsing: an empty fragment is an empty object, and
/// non-JSON text survives as a string so the caller can report it instead of
/// this layer raising.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// A fully reassembled response: text, tool calls, normalized usage.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCallPayload>,
    pub usage: Option<Usage>,
}

impl AggregatedResponse {
    pub fn from_completion(completion: ChatCompletionResponse) -> Self {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(message) = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
        {
            text = message.content.unwrap_or_default();
            for (index, call) in message.tool_calls.into_iter().enumerate() {
                tool_calls.push(ToolCallPayload {
                    id: call.id.unwrap_or_else(|| format!("call_{index}")),
                    name: call.function.name,
                    arguments: parse_arguments(&call.function.arguments),
                });
            }
        }
        Self {
            text,
            tool_calls,
            usage: completion.usage.map(WireUsage::normalize),
        }
    }

    /// The response body parsed as a structured-output object.
    ///
    /// When the model answered with free text instead of the requested
    /// structure, this is a descriptive error the caller can turn into a
    /// synthetic terminal action, never a panic.
    pub fn structured(&self) -> Result<Value, ProviderError> {
        match serde_json::from_str::<Value>(&self.text) {
            Ok(value) if value.is_object() => Ok(value),
            _ => Err(ProviderError::MissingStructuredOutput(preview(&self.text))),
        }
    }

    /// The forced tool call named `name`, if the model produced one.
    pub fn tool_call_named(&self, name: &str) -> Option<&ToolCallPayload> {
        self.tool_calls.iter().find(|call| call.name == name)
    }

    pub fn first_tool_call(&self) -> Option<&ToolCallPayload> {
        self.tool_calls.first()
    }
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.is_empty() {
        return "(empty response)".to_string();
    }
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(LIMIT).collect();
    format!("{head}...")
}
