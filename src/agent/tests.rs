use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

use super::*;
use crate::error::ProviderError;
use crate::llm::AggregatedResponse;
use crate::tools::ToolOutcome;

struct MockBackend {
    responses: Mutex<VecDeque<Result<AggregatedResponse, ProviderError>>>,
    message_counts: Mutex<Vec<usize>>,
    base_url: String,
}

impl MockBackend {
    fn new(responses: Vec<Result<AggregatedResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            message_counts: Mutex::new(Vec::new()),
            base_url: "http://localhost:8080/v1".to_string(),
        })
    }

    fn message_counts(&self) -> Vec<usize> {
        self.message_counts.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(&self, request: ChatRequest) -> Result<AggregatedResponse, ProviderError> {
        self.message_counts
            .lock()
            .expect("mock lock")
            .push(request.messages.len());
        self.responses
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Request("mock exhausted".to_string())))
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn usage(prompt: u64, completion: u64) -> Usage {
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        ..Usage::default()
    }
}

/// A combined-mode structured output choosing `action`.
fn next_step(action: Value) -> Result<AggregatedResponse, ProviderError> {
    let body = json!({
        "reasoning_steps": ["assess task"],
        "current_situation": "working",
        "plan_status": "on track",
        "enough_data": false,
        "remaining_steps": ["run the chosen tool"],
        "task_completed": false,
        "function": action,
    });
    Ok(AggregatedResponse {
        text: body.to_string(),
        tool_calls: vec![],
        usage: Some(usage(50, 20)),
    })
}

fn final_action(answer: &str) -> Value {
    json!({
        "tool_name": "final_answer",
        "reasoning": "done",
        "completed_steps": ["did the work"],
        "answer": answer,
        "status": "completed",
    })
}

fn echo_tool() -> ToolSpec {
    ToolSpec::new("echo", "Repeats the given text back as an observation")
        .with_schema(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
            "additionalProperties": false
        }))
        .expect("schema valid")
        .with_handler(|args, _context| async move {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            Ok(ToolOutcome::Observation(text))
        })
}

fn build_agent(backend: Arc<MockBackend>) -> Agent {
    Agent::builder(backend, "summarize the repository")
        .model("test-model")
        .tool(echo_tool())
        .build()
        .expect("agent builds")
}

#[tokio::test]
async fn single_step_run_completes_with_one_request() {
    let backend = MockBackend::new(vec![next_step(final_action("# All done"))]);
    let agent = build_agent(backend);

    let report = agent.execute().await.expect("run succeeds");

    assert_eq!(report.status, FinalStatus::Completed);
    assert_eq!(report.state, AgentState::Completed);
    assert_eq!(report.answer, "# All done");
    assert_eq!(report.steps, 1);
    assert_eq!(report.usage.request_count, 1);
    assert_eq!(report.usage.totals.prompt_tokens, 50);
    assert_eq!(agent.state().await, AgentState::Completed);
}

#[tokio::test]
async fn clarification_suspends_until_answered() {
    let backend = MockBackend::new(vec![
        next_step(json!({
            "tool_name": "request_clarification",
            "reasoning": "the task is ambiguous",
            "questions": ["Which repository?", "Which branch?"],
        })),
        next_step(final_action("main branch summarized")),
    ]);
    let agent = Arc::new(build_agent(backend));

    let runner = Arc::clone(&agent);
    let handle = tokio::spawn(async move { runner.execute().await });

    timeout(Duration::from_secs(5), async {
        while agent.state().await != AgentState::WaitingForClarification {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent reaches waiting state");

    agent
        .provide_clarification("the main branch of this repository")
        .await
        .expect("clarification accepted while waiting");

    let report = handle.await.expect("task joins").expect("run succeeds");
    assert_eq!(report.status, FinalStatus::Completed);
    assert_eq!(report.steps, 2);

    // Once terminal, further clarifications are rejected.
    let err = agent
        .provide_clarification("too late")
        .await
        .expect_err("must reject");
    assert!(matches!(err, AgentError::NotWaitingForClarification(_)));
}

#[tokio::test]
async fn iteration_cap_forces_termination() {
    let backend = MockBackend::new(vec![
        next_step(json!({"tool_name": "echo", "text": "step one"})),
        next_step(json!({"tool_name": "echo", "text": "step two"})),
        next_step(final_action("wrapped up at the cap")),
    ]);
    let agent = Agent::builder(backend, "long task")
        .model("test-model")
        .tool(echo_tool())
        .max_iterations(3)
        .build()
        .expect("agent builds");

    let report = agent.execute().await.expect("run succeeds");
    assert_eq!(report.status, FinalStatus::Completed);
    assert_eq!(report.steps, 3);
    assert_eq!(report.usage.request_count, 3);
}

#[tokio::test]
async fn narrowed_candidates_reject_non_finalizing_actions() {
    // At the last allowed iteration only finalizing tools remain; a model
    // that still picks another tool ends the run as an error.
    let backend = MockBackend::new(vec![
        next_step(json!({"tool_name": "echo", "text": "one"})),
        next_step(json!({"tool_name": "echo", "text": "two"})),
    ]);
    let agent = Agent::builder(backend, "long task")
        .model("test-model")
        .tool(echo_tool())
        .max_iterations(2)
        .build()
        .expect("agent builds");

    let report = agent.execute().await.expect("run ends without panic");
    assert_eq!(report.status, FinalStatus::Error);
    assert_eq!(report.state, AgentState::Error);
    assert_eq!(report.steps, 2);
}

#[tokio::test]
async fn free_text_response_becomes_synthetic_error_answer() {
    let backend = MockBackend::new(vec![Ok(AggregatedResponse {
        text: "Sure! Here's what I think about the repo...".to_string(),
        tool_calls: vec![],
        usage: None,
    })]);
    let agent = build_agent(backend);

    let report = agent.execute().await.expect("run ends without panic");
    assert_eq!(report.status, FinalStatus::Error);
    assert_eq!(report.state, AgentState::Error);
    assert!(report.answer.contains("what I think"));
    // No usage reported: the request is still booked, estimated.
    assert_eq!(report.usage.request_count, 1);
    assert!(report.usage.totals.estimated);
}

#[tokio::test]
async fn transport_error_fails_the_run() {
    let backend = MockBackend::new(vec![Err(ProviderError::Request(
        "connection refused".to_string(),
    ))]);
    let agent = build_agent(backend);

    let err = agent.execute().await.expect_err("run fails");
    assert!(matches!(err, AgentError::Provider(_)));
    assert_eq!(agent.state().await, AgentState::Failed);
}

#[tokio::test]
async fn tool_failure_feeds_back_as_error_observation() {
    let failing = ToolSpec::new("flaky", "always fails").with_handler(|_args, _context| async {
        Err(crate::error::ToolError::Execution("disk on fire".to_string()))
    });
    let backend = MockBackend::new(vec![
        next_step(json!({"tool_name": "flaky"})),
        next_step(final_action("recovered")),
    ]);
    let agent = Agent::builder(backend, "fragile task")
        .model("test-model")
        .tool(failing)
        .build()
        .expect("agent builds");

    let report = agent.execute().await.expect("run succeeds");
    assert_eq!(report.status, FinalStatus::Completed);
    assert_eq!(report.steps, 2);
}

#[tokio::test]
async fn split_mode_issues_reasoning_then_action() {
    let reasoning_call = AggregatedResponse {
        text: String::new(),
        tool_calls: vec![ToolCallPayload {
            id: "r1".to_string(),
            name: "reasoning".to_string(),
            arguments: json!({
                "reasoning_steps": ["finish up"],
                "current_situation": "ready",
                "plan_status": "complete",
                "enough_data": true,
                "remaining_steps": ["answer"],
                "task_completed": true,
            }),
        }],
        usage: Some(usage(30, 10)),
    };
    let action_call = AggregatedResponse {
        text: String::new(),
        tool_calls: vec![ToolCallPayload {
            id: "a1".to_string(),
            name: "final_answer".to_string(),
            arguments: json!({
                "reasoning": "done",
                "completed_steps": ["everything"],
                "answer": "split-mode answer",
                "status": "completed",
            }),
        }],
        usage: Some(usage(40, 15)),
    };
    let backend = MockBackend::new(vec![Ok(reasoning_call), Ok(action_call)]);
    let agent = Agent::builder(backend, "summarize")
        .model("test-model")
        .mode(ReasoningMode::Split)
        .build()
        .expect("agent builds");

    let report = agent.execute().await.expect("run succeeds");
    assert_eq!(report.status, FinalStatus::Completed);
    assert_eq!(report.answer, "split-mode answer");
    assert_eq!(report.steps, 1);
    // Two requests per iteration in split mode.
    assert_eq!(report.usage.request_count, 2);
    assert_eq!(report.usage.totals.prompt_tokens, 70);
}

#[tokio::test]
async fn every_outbound_request_honors_the_conversation_cap() {
    // The split-mode reasoning echo appends two messages between the
    // reasoning and action requests; the cap must bound both.
    let reasoning = |next: &str| {
        Ok(AggregatedResponse {
            text: String::new(),
            tool_calls: vec![ToolCallPayload {
                id: format!("r-{next}"),
                name: "reasoning".to_string(),
                arguments: json!({
                    "reasoning_steps": ["work"],
                    "current_situation": "in progress",
                    "plan_status": "ongoing",
                    "enough_data": false,
                    "remaining_steps": [next],
                    "task_completed": false,
                }),
            }],
            usage: Some(usage(10, 5)),
        })
    };
    let action = |id: &str, name: &str, arguments: Value| {
        Ok(AggregatedResponse {
            text: String::new(),
            tool_calls: vec![ToolCallPayload {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            usage: Some(usage(10, 5)),
        })
    };

    let backend = MockBackend::new(vec![
        reasoning("look around"),
        action("a1", "echo", json!({"text": "looked"})),
        reasoning("answer"),
        action(
            "a2",
            "final_answer",
            json!({
                "reasoning": "done",
                "completed_steps": ["looked"],
                "answer": "bounded",
                "status": "completed",
            }),
        ),
    ]);
    let agent = Agent::builder(Arc::clone(&backend) as Arc<dyn CompletionBackend>, "capped task")
        .model("test-model")
        .tool(echo_tool())
        .mode(ReasoningMode::Split)
        .max_conversation_messages(3)
        .build()
        .expect("agent builds");

    let report = agent.execute().await.expect("run succeeds");
    assert_eq!(report.status, FinalStatus::Completed);

    let counts = backend.message_counts();
    assert_eq!(counts.len(), 4);
    assert!(
        counts.iter().all(|count| *count <= 3),
        "request message counts {counts:?} exceed the cap"
    );
}

#[tokio::test]
async fn continue_conversation_rearms_a_finished_agent() {
    let backend = MockBackend::new(vec![
        next_step(final_action("first answer")),
        next_step(final_action("second answer")),
    ]);
    let agent = build_agent(backend);

    let first = agent.execute().await.expect("first run succeeds");
    assert_eq!(first.answer, "first answer");

    agent
        .continue_conversation("also check the tests directory")
        .await
        .expect("continuation accepted");
    assert_eq!(agent.state().await, AgentState::Pending);

    let second = agent.execute().await.expect("second run succeeds");
    assert_eq!(second.answer, "second answer");
    assert_eq!(second.steps, 1);
    // The ledger spans both runs.
    assert_eq!(second.usage.request_count, 2);
}

#[tokio::test]
async fn run_log_is_persisted_on_finalization() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = MockBackend::new(vec![
        next_step(json!({"tool_name": "echo", "text": "observed"})),
        next_step(final_action("logged answer")),
    ]);
    let agent = Agent::builder(backend, "loggable task")
        .model("test-model")
        .tool(echo_tool())
        .log_dir(dir.path())
        .build()
        .expect("agent builds");

    agent.execute().await.expect("run succeeds");

    let mut entries = std::fs::read_dir(dir.path())
        .expect("log dir readable")
        .map(|entry| entry.expect("dir entry").path())
        .collect::<Vec<_>>();
    assert_eq!(entries.len(), 1);
    let path = entries.pop().expect("one log file");
    assert!(path.to_string_lossy().ends_with("-log.json"));

    let log: Value =
        serde_json::from_str(&std::fs::read_to_string(path).expect("log readable"))
            .expect("log is valid json");
    assert_eq!(log["task"], "loggable task");
    assert_eq!(log["model"], "test-model");
    assert!(log.get("api_key").is_none());
    // Two reasoning entries and two tool executions, in order.
    let kinds: Vec<&str> = log["entries"]
        .as_array()
        .expect("entries array")
        .iter()
        .map(|entry| entry["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["reasoning", "tool_execution", "reasoning", "tool_execution"]
    );
    assert!(log["usage"]["request_count"].as_u64().is_some());
}

#[tokio::test]
async fn builder_rejects_duplicate_tool_names() {
    let backend = MockBackend::new(vec![]);
    let result = Agent::builder(backend, "task")
        .model("test-model")
        .tool(echo_tool())
        .tool(echo_tool())
        .build();

    assert!(matches!(result, Err(AgentError::Config(_))));
}

#[tokio::test]
async fn builder_requires_model_and_task() {
    let backend = MockBackend::new(vec![]);
    assert!(matches!(
        Agent::builder(Arc::clone(&backend) as Arc<dyn CompletionBackend>, "task").build(),
        Err(AgentError::Config(_))
    ));
    assert!(matches!(
        Agent::builder(backend, "   ").model("m").build(),
        Err(AgentError::Config(_))
    ));
}

#[tokio::test]
async fn search_budget_drops_search_tools_from_candidates() {
    let search_tool = ToolSpec::new("web_search", "Search the web")
        .with_schema(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
            "additionalProperties": false
        }))
        .expect("schema valid")
        .searching()
        .with_handler(|_args, _context| async {
            Ok(ToolOutcome::Observation("results".to_string()))
        });

    let backend = MockBackend::new(vec![
        next_step(json!({"tool_name": "web_search", "query": "rust agents"})),
        // Budget exhausted: the same action is now outside the candidate set.
        next_step(json!({"tool_name": "web_search", "query": "more rust agents"})),
    ]);
    let agent = Agent::builder(backend, "research task")
        .model("test-model")
        .tool(search_tool)
        .max_searches(1)
        .build()
        .expect("agent builds");

    let report = agent.execute().await.expect("run ends without panic");
    assert_eq!(report.status, FinalStatus::Error);
    assert_eq!(report.steps, 2);
}
