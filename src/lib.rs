//! Schema-guided reasoning agent runtime.
//!
//! An [`Agent`] drives an iterative loop against any OpenAI-compatible
//! completion backend: each step the model emits an explicit reasoning
//! record and picks exactly one tool out of a discriminated schema union,
//! the runtime executes that tool, and the observation is fed back into the
//! conversation. Budgets (iterations, searches, clarifications) narrow the
//! candidate tool set until the model is forced to finalize.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sgr_agent::{Agent, OpenAiCompatBackend, OpenAiCompatConfig, ToolSpec};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(OpenAiCompatBackend::new(OpenAiCompatConfig::new(
//!     "https://api.openai.com/v1",
//!     std::env::var("OPENAI_API_KEY")?,
//! ))?);
//!
//! let agent = Agent::builder(backend, "Summarize the repository layout")
//!     .model("gpt-4o-mini")
//!     .tool(ToolSpec::new("read_file", "Read a file from the working directory"))
//!     .max_iterations(6)
//!     .build()?;
//!
//! let report = agent.execute().await?;
//! println!("{} ({:?})", report.answer, report.status);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod provider;
pub mod schema;
pub mod tools;
pub mod usage;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, AgentEvent, AgentState, ReasoningMode, RunReport,
};
pub use agent::runlog::{LogEntry, RunLog};
pub use conversation::Conversation;
pub use error::{AgentError, ProviderError, SchemaError, ToolError};
pub use llm::{
    AggregatedResponse, ChatMessage, ChatRequest, CompletionBackend, OpenAiCompatBackend,
    OpenAiCompatConfig, ResponsePayload, ToolCallPayload, ToolChoicePolicy, ToolDefinition,
};
pub use provider::ProviderKind;
pub use schema::ReasoningRecord;
pub use tools::{FinalStatus, ToolContext, ToolOutcome, ToolSpec};
pub use usage::{ModelPricing, RequestAudit, Usage, UsageLedger, UsageSummary};
