//! Per-run execution log persisted as JSON for post-hoc inspection.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::AgentError;
use crate::schema::ReasoningRecord;
use crate::usage::UsageSummary;

/// One recorded event of the run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Reasoning {
        step: u32,
        timestamp: DateTime<Utc>,
        record: ReasoningRecord,
    },
    ToolExecution {
        step: u32,
        timestamp: DateTime<Utc>,
        tool: String,
        arguments: Value,
        result: String,
    },
}

/// Complete trace of one agent run. Holds no credentials: the model is
/// identified by name and base URL only.
#[derive(Debug, Serialize)]
pub struct RunLog {
    pub agent_id: String,
    pub model: String,
    pub base_url: String,
    pub task: String,
    pub tools: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
}

impl RunLog {
    pub fn new(
        agent_id: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        task: impl Into<String>,
        tools: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: model.into(),
            base_url: base_url.into(),
            task: task.into(),
            tools,
            started_at: Utc::now(),
            entries: Vec::new(),
            usage: None,
        }
    }

    pub fn record_reasoning(&mut self, step: u32, record: ReasoningRecord) {
        self.entries.push(LogEntry::Reasoning {
            step,
            timestamp: Utc::now(),
            record,
        });
    }

    pub fn record_tool(&mut self, step: u32, tool: &str, arguments: Value, result: &str) {
        self.entries.push(LogEntry::ToolExecution {
            step,
            timestamp: Utc::now(),
            tool: tool.to_string(),
            arguments,
            result: result.to_string(),
        });
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-log.json",
            self.started_at.format("%Y%m%d-%H%M%S"),
            self.agent_id
        )
    }

    /// Writes the log into `directory`, creating it if needed. Returns the
    /// full path of the written file.
    pub async fn persist(&self, directory: &Path) -> Result<PathBuf, AgentError> {
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|err| AgentError::RunLog(err.to_string()))?;

        let path = directory.join(self.file_name());
        let body = serde_json::to_vec_pretty(self)
            .map_err(|err| AgentError::RunLog(err.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| AgentError::RunLog(err.to_string()))?;
        Ok(path)
    }
}
