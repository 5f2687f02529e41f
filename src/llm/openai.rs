use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::llm::stream::{AggregatedResponse, ChatChunk, ChatCompletionResponse, StreamAggregator};
use crate::llm::{ChatMessage, ChatRequest, CompletionBackend, ResponsePayload, ToolChoicePolicy};

/// Runtime configuration for [`OpenAiCompatBackend`].
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Base endpoint, for example `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token for the backend.
    pub api_key: String,
}

impl OpenAiCompatConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

/// Streaming client for any backend speaking the OpenAI chat-completions
/// protocol. Responses are consumed as server-sent events and reassembled by
/// [`StreamAggregator`]; backends that ignore the stream flag and answer
/// with a terminal completion object are handled transparently.
#[derive(Debug, Clone)]
pub struct OpenAiCompatBackend {
    client: Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatBackend {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait::async_trait]
impl CompletionBackend for OpenAiCompatBackend {
    async fn complete(&self, request: ChatRequest) -> Result<AggregatedResponse, ProviderError> {
        let body = build_body(&request);

        let response = self
            .client
            .post(self.endpoint())
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("text/event-stream"));

        if !is_event_stream {
            // Some backends ignore the stream flag: the whole completion
            // arrives as one terminal object carrying authoritative usage.
            let completion = response
                .json::<ChatCompletionResponse>()
                .await
                .map_err(|err| ProviderError::Response(err.to_string()))?;
            return Ok(AggregatedResponse::from_completion(completion));
        }

        let mut aggregator = StreamAggregator::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|err| ProviderError::Stream(err.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            for line in drain_complete_lines(&mut buffer) {
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<ChatChunk>(payload) {
                    Ok(chunk) => aggregator.push(chunk),
                    Err(err) => {
                        return Err(ProviderError::Stream(format!(
                            "unparseable fragment `{payload}`: {err}"
                        )));
                    }
                }
            }
        }

        if !buffer.trim().is_empty() {
            warn!(remainder = buffer.trim(), "stream ended mid-fragment");
        }

        let aggregated = aggregator.finish(None);
        debug!(
            text_len = aggregated.text.len(),
            tool_calls = aggregated.tool_calls.len(),
            has_usage = aggregated.usage.is_some(),
            "stream aggregated"
        );
        Ok(aggregated)
    }

    fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

/// Splits off every complete line, leaving a trailing partial fragment in
/// the buffer for the next network chunk.
fn drain_complete_lines(buffer: &mut String) -> Vec<String> {
    let Some(last_newline) = buffer.rfind('\n') else {
        return Vec::new();
    };
    let complete: String = buffer.drain(..=last_newline).collect();
    complete
        .lines()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<Value>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| match message {
            ChatMessage::System(content) => WireMessage::System {
                content: content.clone(),
            },
            ChatMessage::User(content) => WireMessage::User {
                content: content.clone(),
            },
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => WireMessage::Assistant {
                content: content.clone(),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string(),
                                    },
                                })
                            })
                            .collect(),
                    )
                },
            },
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => WireMessage::Tool {
                tool_call_id: tool_call_id.clone(),
                content: content.clone(),
            },
        })
        .collect()
}

fn build_body(request: &ChatRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": to_wire_messages(&request.messages),
        "stream": true,
    });
    let object = body.as_object_mut().expect("body is an object");

    if let Some(temperature) = request.temperature {
        object.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        object.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if request.stream_usage {
        object.insert(
            "stream_options".to_string(),
            json!({"include_usage": true}),
        );
    }

    match &request.payload {
        ResponsePayload::StructuredOutput { name, schema } => {
            object.insert(
                "response_format".to_string(),
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": name,
                        "schema": schema,
                        "strict": true,
                    },
                }),
            );
        }
        ResponsePayload::Tools {
            definitions,
            choice,
        } => {
            object.insert(
                "tools".to_string(),
                Value::Array(
                    definitions
                        .iter()
                        .map(|definition| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": definition.name,
                                    "description": definition.description,
                                    "parameters": definition.parameters,
                                },
                            })
                        })
                        .collect(),
                ),
            );
            object.insert(
                "tool_choice".to_string(),
                match choice {
                    ToolChoicePolicy::Required => json!("required"),
                    ToolChoicePolicy::Named(name) => json!({
                        "type": "function",
                        "function": {"name": name},
                    }),
                },
            );
        }
    }

    if let Some(extras) = request.extra_body.as_object() {
        for (key, value) in extras {
            object.insert(key.clone(), value.clone());
        }
    }

    body
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
        if let Some(message) = parsed
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            return format!("api error ({status}): {message}");
        }
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::{ToolCallPayload, ToolDefinition};

    fn base_request(payload: ResponsePayload) -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            messages: vec![
                ChatMessage::System("You are a careful agent".to_string()),
                ChatMessage::User("Summarize the repo".to_string()),
                ChatMessage::Assistant {
                    content: Some("Reading files".to_string()),
                    tool_calls: vec![ToolCallPayload {
                        id: "1-action".to_string(),
                        name: "read_file".to_string(),
                        arguments: json!({"path": "src/lib.rs"}),
                    }],
                },
                ChatMessage::Tool {
                    tool_call_id: "1-action".to_string(),
                    content: "fn main() {}".to_string(),
                },
            ],
            payload,
            temperature: Some(0.3),
            max_tokens: Some(4096),
            extra_body: json!({"litellm_session_id": "agent_7"}),
            stream_usage: true,
        }
    }

    #[test]
    fn body_carries_messages_limits_and_extras() {
        let body = build_body(&base_request(ResponsePayload::StructuredOutput {
            name: "next_step".to_string(),
            schema: json!({"type": "object"}),
        }));

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Summarize the repo");
        assert_eq!(
            body["messages"][2]["tool_calls"][0]["function"]["name"],
            "read_file"
        );
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["tool_call_id"], "1-action");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["litellm_session_id"], "agent_7");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "next_step");
    }

    #[test]
    fn body_serializes_tools_and_named_choice() {
        let body = build_body(&base_request(ResponsePayload::Tools {
            definitions: vec![ToolDefinition {
                name: "reasoning".to_string(),
                description: "plan the next step".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            choice: ToolChoicePolicy::Named("reasoning".to_string()),
        }));

        assert_eq!(body["tools"][0]["function"]["name"], "reasoning");
        assert_eq!(body["tool_choice"]["function"]["name"], "reasoning");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn required_choice_is_a_bare_mode_string() {
        let body = build_body(&base_request(ResponsePayload::Tools {
            definitions: vec![],
            choice: ToolChoicePolicy::Required,
        }));
        assert_eq!(body["tool_choice"], "required");
    }

    #[test]
    fn partial_lines_stay_buffered_until_complete() {
        let mut buffer = String::from("data: {\"choices\"");
        assert!(drain_complete_lines(&mut buffer).is_empty());

        buffer.push_str(": []}\ndata: [DO");
        let lines = drain_complete_lines(&mut buffer);
        assert_eq!(lines, vec!["data: {\"choices\": []}".to_string()]);
        assert_eq!(buffer, "data: [DO");

        buffer.push_str("NE]\n");
        let lines = drain_complete_lines(&mut buffer);
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
        assert!(buffer.is_empty());
    }
}
