use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error("structured action is missing the '{0}' discriminant field")]
    MissingDiscriminant(&'static str),
    #[error("structured action names unknown tool '{0}'")]
    UnknownTool(String),
    #[error("structured action must be a JSON object, got: {0}")]
    ActionNotObject(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend response invalid: {0}")]
    Response(String),
    #[error("backend stream malformed: {0}")]
    Stream(String),
    #[error("backend returned no structured action: {0}")]
    MissingStructuredOutput(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("agent configuration error: {0}")]
    Config(String),
    #[error("clarification rejected: agent is in state {0}, not waiting for clarification")]
    NotWaitingForClarification(String),
    #[error("failed to persist run log: {0}")]
    RunLog(String),
}
