//! Agent state machine: drives the reasoning/action loop, enforces budgets,
//! and owns every run artifact (conversation, ledger, run log).

pub mod runlog;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt, pin_mut};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::Conversation;
use crate::error::{AgentError, SchemaError};
use crate::llm::{
    AggregatedResponse, ChatMessage, ChatRequest, CompletionBackend, ResponsePayload,
    ToolCallPayload, ToolChoicePolicy, ToolDefinition,
};
use crate::provider::ProviderKind;
use crate::schema::{
    ACTION_FIELD, ReasoningRecord, decode_action, next_step_schema, reasoning_schema,
    strip_constraint_keywords,
};
use crate::tools::system::{REQUEST_CLARIFICATION, final_answer, request_clarification};
use crate::tools::{FinalStatus, ToolContext, ToolOutcome, ToolSpec};
use crate::usage::{ModelPricing, Usage, UsageLedger, UsageSummary};

use runlog::RunLog;

const REASONING_TOOL: &str = "reasoning";

/// Lifecycle of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Pending,
    Researching,
    WaitingForClarification,
    Completed,
    Failed,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Researching => "researching",
            Self::WaitingForClarification => "waiting_for_clarification",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

impl From<FinalStatus> for AgentState {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Completed => Self::Completed,
            FinalStatus::Failed => Self::Failed,
            FinalStatus::Error => Self::Error,
        }
    }
}

/// How each iteration obtains its reasoning and its action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReasoningMode {
    /// One structured-output call returns the reasoning record and the chosen
    /// action atomically.
    #[default]
    Combined,
    /// Two forced tool calls per iteration: a reasoning call, then an action
    /// call over the candidate set.
    Split,
}

/// Externally observable progress events emitted during a run.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Reasoning {
        step: u32,
        record: ReasoningRecord,
    },
    ToolCall {
        step: u32,
        tool: String,
        arguments: Value,
    },
    Observation {
        step: u32,
        tool: String,
        content: String,
    },
    ClarificationRequested {
        questions: Vec<String>,
    },
    Finalized {
        answer: String,
        status: FinalStatus,
    },
}

/// End-of-run artifact returned by [`Agent::execute`].
#[derive(Clone, Debug)]
pub struct RunReport {
    pub answer: String,
    pub status: FinalStatus,
    pub state: AgentState,
    pub steps: u32,
    pub usage: UsageSummary,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: u32,
    pub max_clarifications: u32,
    pub max_searches: u32,
    pub max_conversation_messages: Option<usize>,
    pub mode: ReasoningMode,
    pub working_directory: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub pricing: ModelPricing,
    pub tracking_token: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            temperature: Some(0.4),
            max_tokens: Some(8000),
            max_iterations: 10,
            max_clarifications: 3,
            max_searches: 4,
            max_conversation_messages: None,
            mode: ReasoningMode::Combined,
            working_directory: PathBuf::from("."),
            log_dir: None,
            pricing: ModelPricing::default(),
            tracking_token: None,
        }
    }
}

/// Builder enforcing registry invariants before the agent exists.
pub struct AgentBuilder {
    backend: Arc<dyn CompletionBackend>,
    task: String,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn new(backend: Arc<dyn CompletionBackend>, task: impl Into<String>) -> Self {
        Self {
            backend,
            task: task.into(),
            tools: Vec::new(),
            config: AgentConfig::default(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = Some(max_tokens);
        self
    }

    pub fn max_iterations(mut self, limit: u32) -> Self {
        self.config.max_iterations = limit;
        self
    }

    pub fn max_clarifications(mut self, limit: u32) -> Self {
        self.config.max_clarifications = limit;
        self
    }

    pub fn max_searches(mut self, limit: u32) -> Self {
        self.config.max_searches = limit;
        self
    }

    pub fn max_conversation_messages(mut self, cap: usize) -> Self {
        self.config.max_conversation_messages = Some(cap);
        self
    }

    pub fn mode(mut self, mode: ReasoningMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.working_directory = directory.into();
        self
    }

    pub fn log_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(directory.into());
        self
    }

    pub fn pricing(mut self, pricing: ModelPricing) -> Self {
        self.config.pricing = pricing;
        self
    }

    pub fn tracking_token(mut self, token: impl Into<String>) -> Self {
        self.config.tracking_token = Some(token.into());
        self
    }

    pub fn build(mut self) -> Result<Agent, AgentError> {
        if self.config.model.is_empty() {
            return Err(AgentError::Config("model name is required".to_string()));
        }
        if self.task.trim().is_empty() {
            return Err(AgentError::Config("task must not be empty".to_string()));
        }
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        // Every agent can finalize; the clarification tool is present only
        // while its budget allows at least one use.
        if !self.tools.iter().any(|tool| tool.finalizes()) {
            self.tools.push(final_answer());
        }
        if self.config.max_clarifications > 0
            && !self
                .tools
                .iter()
                .any(|tool| tool.name() == REQUEST_CLARIFICATION)
        {
            self.tools.push(request_clarification());
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name().to_string()) {
                return Err(AgentError::Config(format!(
                    "duplicate tool name: {}",
                    tool.name()
                )));
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        let runlog = RunLog::new(
            &id,
            &self.config.model,
            self.backend.base_url(),
            &self.task,
            self.tools.iter().map(|tool| tool.name().to_string()).collect(),
        );

        let mut conversation = Conversation::new();
        conversation.push(ChatMessage::User(self.task.clone()));

        Ok(Agent {
            id,
            task: self.task,
            backend: self.backend,
            tools: self.tools,
            config: self.config,
            inner: Mutex::new(AgentInner {
                state: AgentState::Pending,
                conversation,
                ledger: UsageLedger::new(),
                runlog,
                iteration: 0,
                searches_used: 0,
                clarifications_used: 0,
                provided_clarification: None,
                outcome: None,
            }),
            clarification: Notify::new(),
        })
    }
}

struct AgentInner {
    state: AgentState,
    conversation: Conversation,
    ledger: UsageLedger,
    runlog: RunLog,
    iteration: u32,
    searches_used: u32,
    clarifications_used: u32,
    provided_clarification: Option<String>,
    outcome: Option<(String, FinalStatus)>,
}

/// One task-scoped run loop over a [`CompletionBackend`].
///
/// All mutable run state sits behind a lock so that
/// [`Agent::provide_clarification`] can be called from another task while
/// [`Agent::execute`] is suspended.
pub struct Agent {
    id: String,
    task: String,
    backend: Arc<dyn CompletionBackend>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    inner: Mutex<AgentInner>,
    clarification: Notify,
}

impl Agent {
    pub fn builder(backend: Arc<dyn CompletionBackend>, task: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(backend, task)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub async fn state(&self) -> AgentState {
        self.inner.lock().await.state
    }

    pub async fn usage(&self) -> UsageSummary {
        self.inner.lock().await.ledger.summary()
    }

    /// Delivers the human's answer to a pending clarification request and
    /// wakes the suspended run loop. Rejected in any other state.
    pub async fn provide_clarification(&self, text: impl Into<String>) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.state != AgentState::WaitingForClarification {
            return Err(AgentError::NotWaitingForClarification(
                inner.state.as_str().to_string(),
            ));
        }
        inner.provided_clarification = Some(text.into());
        drop(inner);
        self.clarification.notify_one();
        Ok(())
    }

    /// Appends a follow-up user message and rearms the loop so that
    /// [`Agent::execute`] can be called again on the same history.
    pub async fn continue_conversation(&self, message: impl Into<String>) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if inner.state == AgentState::WaitingForClarification {
            return Err(AgentError::NotWaitingForClarification(
                "cannot continue while a clarification is pending".to_string(),
            ));
        }
        inner.conversation.push(ChatMessage::User(message.into()));
        inner.state = AgentState::Pending;
        inner.iteration = 0;
        inner.outcome = None;
        Ok(())
    }

    /// Runs the loop to completion, consuming the event stream internally.
    pub async fn execute(&self) -> Result<RunReport, AgentError> {
        let stream = self.execute_stream();
        pin_mut!(stream);
        while let Some(event) = stream.next().await {
            event?;
        }

        let inner = self.inner.lock().await;
        let (answer, status) = inner
            .outcome
            .clone()
            .unwrap_or_else(|| ("".to_string(), FinalStatus::Error));
        Ok(RunReport {
            answer,
            status,
            state: inner.state,
            steps: inner.iteration,
            usage: inner.ledger.summary(),
        })
    }

    /// Runs the loop, yielding progress events as they happen. The stream
    /// ends after [`AgentEvent::Finalized`] or the first hard error; run
    /// artifacts are finalized on either path.
    pub fn execute_stream(&self) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        try_stream! {
            {
                let mut inner = self.inner.lock().await;
                inner.state = AgentState::Researching;
            }
            info!(agent_id = %self.id, model = %self.config.model, "run started");

            loop {
                let step = {
                    let mut inner = self.inner.lock().await;
                    inner.iteration += 1;
                    inner.iteration
                };

                // Hard stop: the narrowed candidate set should have forced a
                // final answer by now; if it did not, end the run ourselves.
                if step > self.config.max_iterations {
                    let answer = "Maximum iterations reached without a final answer".to_string();
                    self.settle(answer.clone(), FinalStatus::Failed).await;
                    yield AgentEvent::Finalized { answer, status: FinalStatus::Failed };
                    break;
                }

                let candidates = self.candidate_tools(step).await;

                let (record, tool_name, arguments) = match self.config.mode {
                    ReasoningMode::Combined => {
                        match self.combined_step(step, &candidates).await? {
                            StepDecision::Act(record, name, args) => (record, name, args),
                            StepDecision::Synthetic(answer) => {
                                self.settle(answer.clone(), FinalStatus::Error).await;
                                yield AgentEvent::Finalized {
                                    answer,
                                    status: FinalStatus::Error,
                                };
                                break;
                            }
                        }
                    }
                    ReasoningMode::Split => {
                        match self.split_step(step, &candidates).await? {
                            StepDecision::Act(record, name, args) => (record, name, args),
                            StepDecision::Synthetic(answer) => {
                                self.settle(answer.clone(), FinalStatus::Error).await;
                                yield AgentEvent::Finalized {
                                    answer,
                                    status: FinalStatus::Error,
                                };
                                break;
                            }
                        }
                    }
                };

                {
                    let mut inner = self.inner.lock().await;
                    inner.runlog.record_reasoning(step, record.clone());
                }
                yield AgentEvent::Reasoning { step, record: record.clone() };

                let Some(tool) = candidates
                    .iter()
                    .find(|candidate| candidate.name() == tool_name)
                    .cloned()
                else {
                    let err = SchemaError::UnknownTool(tool_name.clone());
                    warn!(step, error = %err, "action names an unavailable tool");
                    let answer = err.to_string();
                    self.settle(answer.clone(), FinalStatus::Error).await;
                    yield AgentEvent::Finalized { answer, status: FinalStatus::Error };
                    break;
                };

                yield AgentEvent::ToolCall {
                    step,
                    tool: tool_name.clone(),
                    arguments: arguments.clone(),
                };

                let call_id = format!("{step}-action");
                {
                    let mut inner = self.inner.lock().await;
                    inner.conversation.push(ChatMessage::Assistant {
                        content: Some(record.next_step().to_string()),
                        tool_calls: vec![ToolCallPayload {
                            id: call_id.clone(),
                            name: tool_name.clone(),
                            arguments: arguments.clone(),
                        }],
                    });
                }

                let context = self.tool_context(step).await;
                let outcome = tool.execute(arguments.clone(), context).await;

                if tool.is_search() && outcome.is_ok() {
                    let mut inner = self.inner.lock().await;
                    inner.searches_used += 1;
                }

                match outcome {
                    Ok(ToolOutcome::Final { answer, status }) => {
                        self.push_tool_result(&call_id, &answer).await;
                        self.record_tool(step, &tool_name, &arguments, &answer).await;
                        self.settle(answer.clone(), status).await;
                        yield AgentEvent::Finalized { answer, status };
                        break;
                    }
                    Ok(ToolOutcome::Clarify { questions }) => {
                        let rendered = format!(
                            "Clarification requested:\n{}",
                            questions.join("\n")
                        );
                        self.push_tool_result(&call_id, &rendered).await;
                        self.record_tool(step, &tool_name, &arguments, &rendered).await;
                        {
                            let mut inner = self.inner.lock().await;
                            inner.clarifications_used += 1;
                            inner.state = AgentState::WaitingForClarification;
                        }
                        yield AgentEvent::ClarificationRequested { questions };

                        let reply = self.await_clarification().await;
                        {
                            let mut inner = self.inner.lock().await;
                            inner
                                .conversation
                                .push(ChatMessage::User(format!("Clarification: {reply}")));
                            inner.state = AgentState::Researching;
                        }
                    }
                    Ok(ToolOutcome::Observation(observation)) => {
                        self.push_tool_result(&call_id, &observation).await;
                        self.record_tool(step, &tool_name, &arguments, &observation).await;
                        yield AgentEvent::Observation {
                            step,
                            tool: tool_name,
                            content: observation,
                        };
                    }
                    Err(err) => {
                        // Tool failures feed back into the loop as
                        // observations so the model can route around them.
                        let observation = format!("Error: {err}");
                        warn!(tool = %tool.name(), error = %err, "tool failed");
                        self.push_tool_result(&call_id, &observation).await;
                        self.record_tool(step, &tool_name, &arguments, &observation).await;
                        yield AgentEvent::Observation {
                            step,
                            tool: tool_name,
                            content: observation,
                        };
                    }
                }
            }

            self.finalize().await?;
        }
    }

    /// Narrows the registry per remaining budgets. Collapsing to
    /// finalizing-only on the last allowed iteration forces termination.
    async fn candidate_tools(&self, step: u32) -> Vec<ToolSpec> {
        let inner = self.inner.lock().await;
        let searches_left = inner.searches_used < self.config.max_searches;
        let clarifications_left = inner.clarifications_used < self.config.max_clarifications;
        drop(inner);

        if step >= self.config.max_iterations {
            return self
                .tools
                .iter()
                .filter(|tool| tool.finalizes())
                .cloned()
                .collect();
        }

        self.tools
            .iter()
            .filter(|tool| searches_left || !tool.is_search())
            .filter(|tool| clarifications_left || tool.name() != REQUEST_CLARIFICATION)
            .cloned()
            .collect()
    }

    async fn tool_context(&self, step: u32) -> ToolContext {
        let inner = self.inner.lock().await;
        ToolContext {
            working_directory: self.config.working_directory.clone(),
            iteration: step,
            searches_used: inner.searches_used,
            clarifications_used: inner.clarifications_used,
        }
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::from_base_url(self.backend.base_url())
    }

    fn tracking_token(&self) -> String {
        self.config
            .tracking_token
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }

    /// Snapshot of the request context. Truncation runs here, before every
    /// outbound request, so mid-iteration appends (the split-mode reasoning
    /// echo, tool observations) can never push a request past the cap.
    async fn outbound_messages(&self) -> Vec<ChatMessage> {
        let mut inner = self.inner.lock().await;
        if let Some(cap) = self.config.max_conversation_messages {
            if let Some(dropped) = inner.conversation.truncate(cap) {
                debug!(dropped, "conversation truncated");
            }
        }
        let mut messages = Vec::with_capacity(inner.conversation.len() + 1);
        if let Some(prompt) = &self.config.system_prompt {
            messages.push(ChatMessage::System(prompt.clone()));
        }
        messages.extend(inner.conversation.messages().iter().cloned());
        messages
    }

    fn request(&self, messages: Vec<ChatMessage>, payload: ResponsePayload) -> ChatRequest {
        let kind = self.provider_kind();
        ChatRequest {
            model: self.config.model.clone(),
            messages,
            payload,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            extra_body: kind.extra_body(&self.tracking_token()),
            stream_usage: kind.include_stream_usage(),
        }
    }

    /// Issues one request and books it into the ledger, estimating usage
    /// when the backend reported none.
    async fn complete_and_record(
        &self,
        request: ChatRequest,
    ) -> Result<AggregatedResponse, AgentError> {
        let prompt = render_messages(&request.messages);
        let response = match self.backend.complete(request).await {
            Ok(response) => response,
            Err(err) => {
                // Transport failures end the run as FAILED.
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = AgentState::Failed;
                }
                self.finalize().await?;
                return Err(err.into());
            }
        };

        let rendered = render_response(&response);
        let usage = response
            .usage
            .clone()
            .unwrap_or_else(|| Usage::estimate(prompt.chars().count(), rendered.chars().count()));
        let mut inner = self.inner.lock().await;
        inner
            .ledger
            .record(&prompt, &rendered, usage, &self.config.pricing);
        Ok(response)
    }

    /// Single-call iteration: one structured-output request returns the
    /// reasoning record and the chosen action together.
    async fn combined_step(
        &self,
        step: u32,
        candidates: &[ToolSpec],
    ) -> Result<StepDecision, AgentError> {
        let mut schema = next_step_schema(candidates);
        if self.provider_kind().strict_schema_compiler() {
            strip_constraint_keywords(&mut schema);
        }

        let messages = self.outbound_messages().await;
        let request = self.request(
            messages,
            ResponsePayload::StructuredOutput {
                name: "next_step".to_string(),
                schema,
            },
        );
        let response = self.complete_and_record(request).await?;

        let value = match response.structured() {
            Ok(value) => value,
            Err(err) => {
                warn!(step, error = %err, "structured output missing, synthesizing final answer");
                return Ok(StepDecision::Synthetic(response.text));
            }
        };

        let record = match ReasoningRecord::parse(value.clone()) {
            Ok(record) => record,
            Err(err) => {
                warn!(step, error = %err, "malformed reasoning record");
                return Ok(StepDecision::Synthetic(value.to_string()));
            }
        };

        let action = value.get(ACTION_FIELD).cloned().unwrap_or(Value::Null);
        match decode_action(&action) {
            Ok((name, args)) => Ok(StepDecision::Act(record, name, args)),
            Err(err) => {
                warn!(step, error = %err, "undecodable action");
                Ok(StepDecision::Synthetic(value.to_string()))
            }
        }
    }

    /// Two-call iteration: a forced reasoning tool call, echoed back into the
    /// conversation, then a forced action call over the candidate set.
    async fn split_step(
        &self,
        step: u32,
        candidates: &[ToolSpec],
    ) -> Result<StepDecision, AgentError> {
        let messages = self.outbound_messages().await;
        let request = self.request(
            messages,
            ResponsePayload::Tools {
                definitions: vec![ToolDefinition {
                    name: REASONING_TOOL.to_string(),
                    description: "Record step-by-step reasoning about the current state of the task"
                        .to_string(),
                    parameters: reasoning_schema(),
                }],
                choice: ToolChoicePolicy::Named(REASONING_TOOL.to_string()),
            },
        );
        let response = self.complete_and_record(request).await?;

        let Some(call) = response.tool_call_named(REASONING_TOOL) else {
            warn!(step, "backend skipped the forced reasoning call");
            return Ok(StepDecision::Synthetic(response.text));
        };
        let record = match ReasoningRecord::parse(call.arguments.clone()) {
            Ok(record) => record,
            Err(err) => {
                warn!(step, error = %err, "malformed reasoning record");
                return Ok(StepDecision::Synthetic(call.arguments.to_string()));
            }
        };

        // Echo the reasoning into the history so the action call sees it.
        {
            let mut inner = self.inner.lock().await;
            inner.conversation.push(ChatMessage::Assistant {
                content: None,
                tool_calls: vec![call.clone()],
            });
            inner.conversation.push(ChatMessage::Tool {
                tool_call_id: call.id.clone(),
                content: format!("Reasoning accepted. Next: {}", record.next_step()),
            });
        }

        let messages = self.outbound_messages().await;
        let request = self.request(
            messages,
            ResponsePayload::Tools {
                definitions: candidates
                    .iter()
                    .map(|tool| ToolDefinition {
                        name: tool.name().to_string(),
                        description: tool.description().to_string(),
                        parameters: tool.parameters().clone(),
                    })
                    .collect(),
                choice: ToolChoicePolicy::Required,
            },
        );
        let response = self.complete_and_record(request).await?;

        match response.first_tool_call() {
            Some(call) => Ok(StepDecision::Act(
                record,
                call.name.clone(),
                call.arguments.clone(),
            )),
            None => {
                warn!(step, "backend returned no action call");
                Ok(StepDecision::Synthetic(response.text))
            }
        }
    }

    async fn await_clarification(&self) -> String {
        loop {
            let notified = self.clarification.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(reply) = inner.provided_clarification.take() {
                    return reply;
                }
            }
            notified.await;
        }
    }

    async fn push_tool_result(&self, call_id: &str, content: &str) {
        let mut inner = self.inner.lock().await;
        inner.conversation.push(ChatMessage::Tool {
            tool_call_id: call_id.to_string(),
            content: content.to_string(),
        });
    }

    async fn record_tool(&self, step: u32, tool: &str, arguments: &Value, result: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .runlog
            .record_tool(step, tool, arguments.clone(), result);
    }

    async fn settle(&self, answer: String, status: FinalStatus) {
        let mut inner = self.inner.lock().await;
        inner.state = status.into();
        inner.outcome = Some((answer, status));
    }

    /// Run-exit bookkeeping executed on every path out of the loop: summary
    /// log line plus run-log persistence when a log directory is configured.
    async fn finalize(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        let summary = inner.ledger.summary();
        inner.runlog.usage = Some(summary.clone());
        info!(
            agent_id = %self.id,
            state = inner.state.as_str(),
            requests = summary.request_count,
            prompt_tokens = summary.totals.prompt_tokens,
            completion_tokens = summary.totals.completion_tokens,
            cost_usd = summary.cost_usd,
            estimated = summary.totals.estimated,
            "run finalized"
        );
        if inner.ledger.any_estimated() {
            warn!(
                agent_id = %self.id,
                "token totals include character-count estimates and may diverge from real tokenization"
            );
        }

        if let Some(directory) = &self.config.log_dir {
            let path = inner.runlog.persist(directory).await?;
            debug!(path = %path.display(), "run log written");
        }
        Ok(())
    }
}

enum StepDecision {
    /// Reasoning plus the decoded action to run.
    Act(ReasoningRecord, String, Value),
    /// Contract violation: run ends with this text as a synthetic ERROR
    /// final answer.
    Synthetic(String),
}

fn render_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| {
            format!(
                "{}: {}",
                message.role(),
                message.content().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_response(response: &AggregatedResponse) -> String {
    if response.tool_calls.is_empty() {
        return response.text.clone();
    }
    let calls: Vec<String> = response
        .tool_calls
        .iter()
        .map(|call| format!("{}({})", call.name, call.arguments))
        .collect();
    format!("{}\n{}", response.text, calls.join("\n"))
}
