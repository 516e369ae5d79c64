//! Task definitions and execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a task: a type tag plus type-specific parameters.
///
/// Parameters are opaque here; the command implementation registered under
/// `kind` interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl CommandSpec {
    /// A command with no parameters.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Parameters as a JSON object value.
    #[must_use]
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

const fn enabled_by_default() -> bool {
    true
}

/// A named, schedulable unit of automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique name; the registry key.
    pub name: String,
    /// Six-field cron expression: sec min hour day-of-month month day-of-week.
    pub schedule: String,
    /// Ordered steps.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TaskDefinition {
    /// An enabled task with the given commands.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        commands: Vec<CommandSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            commands,
            enabled: true,
            description: None,
        }
    }
}

/// Overall outcome of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// Outcome of a single command within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub duration_ms: u64,
    /// Retries used; only present when greater than zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of running one task once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub task: String,
    pub status: ExecutionStatus,
    /// From task start to final outcome.
    pub duration_ms: u64,
    pub results: Vec<CommandOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// One entry in a task's bounded execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub status: ExecutionStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
