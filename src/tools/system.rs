//! Built-in system tools every agent carries: the final-answer variant that
//! terminates the run and the clarification variant that suspends it.

use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{FinalStatus, ToolOutcome, ToolSpec};

pub const FINAL_ANSWER: &str = "final_answer";
pub const REQUEST_CLARIFICATION: &str = "request_clarification";

/// Finalizes the task. Writes the terminal state and the answer that the
/// caller retrieves after the run.
pub fn final_answer() -> ToolSpec {
    ToolSpec::new(
        FINAL_ANSWER,
        "Finalize the task and complete execution after all steps are done. \
         Provide the comprehensive final answer with exact factual details, \
         formatted in Markdown.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "reasoning": {
                "type": "string",
                "description": "Why the task is now complete and how the answer was verified"
            },
            "completed_steps": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 1,
                "maxItems": 5,
                "description": "Summary of completed steps including verification"
            },
            "answer": {
                "type": "string",
                "description": "Comprehensive final answer in Markdown"
            },
            "status": {
                "type": "string",
                "enum": ["completed", "failed", "error"],
                "description": "Task completion status"
            }
        },
        "required": ["reasoning", "completed_steps", "answer", "status"],
        "additionalProperties": false
    }))
    .expect("final_answer schema is valid")
    .finalizing()
    .with_handler(|args, _context| async move {
        let answer = string_field(&args, "answer")?;
        let status = args
            .get("status")
            .and_then(Value::as_str)
            .and_then(FinalStatus::parse)
            .unwrap_or(FinalStatus::Completed);
        Ok(ToolOutcome::Final { answer, status })
    })
}

/// Requests additional human input. Executing this suspends the loop until
/// the caller supplies clarification text.
pub fn request_clarification() -> ToolSpec {
    ToolSpec::new(
        REQUEST_CLARIFICATION,
        "Ask the user clarifying questions when the task is ambiguous or \
         missing information required to proceed.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "reasoning": {
                "type": "string",
                "description": "Why clarification is needed before continuing"
            },
            "questions": {
                "type": "array",
                "items": {"type": "string"},
                "minItems": 1,
                "maxItems": 5,
                "description": "Specific questions for the user"
            }
        },
        "required": ["reasoning", "questions"],
        "additionalProperties": false
    }))
    .expect("request_clarification schema is valid")
    .with_handler(|args, _context| async move {
        let questions = args
            .get("questions")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if questions.is_empty() {
            return Err(ToolError::Execution(
                "clarification request carried no questions".to_string(),
            ));
        }
        Ok(ToolOutcome::Clarify { questions })
    })
}

fn string_field(args: &Value, field: &str) -> Result<String, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::Execution(format!("missing string field '{field}'")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::ToolContext;

    #[tokio::test]
    async fn final_answer_reports_terminal_outcome() {
        let outcome = final_answer()
            .execute(
                json!({
                    "reasoning": "verified output",
                    "completed_steps": ["read file", "wrote summary"],
                    "answer": "# Done",
                    "status": "completed"
                }),
                ToolContext::default(),
            )
            .await
            .expect("executes");

        assert_eq!(
            outcome,
            ToolOutcome::Final {
                answer: "# Done".to_string(),
                status: FinalStatus::Completed,
            }
        );
    }

    #[tokio::test]
    async fn final_answer_accepts_error_status() {
        let outcome = final_answer()
            .execute(
                json!({
                    "reasoning": "could not proceed",
                    "completed_steps": ["attempted task"],
                    "answer": "failed to comply",
                    "status": "error"
                }),
                ToolContext::default(),
            )
            .await
            .expect("executes");

        assert!(matches!(
            outcome,
            ToolOutcome::Final {
                status: FinalStatus::Error,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn clarification_collects_questions() {
        let outcome = request_clarification()
            .execute(
                json!({
                    "reasoning": "ambiguous task",
                    "questions": ["Which repository?", "Which branch?"]
                }),
                ToolContext::default(),
            )
            .await
            .expect("executes");

        assert_eq!(
            outcome,
            ToolOutcome::Clarify {
                questions: vec![
                    "Which repository?".to_string(),
                    "Which branch?".to_string()
                ],
            }
        );
    }
}
