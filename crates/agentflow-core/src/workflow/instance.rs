//! Runtime state of a workflow execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::context::DataMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceContext {
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub initiator: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub step_index: usize,
    pub step_name: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Options for starting a workflow.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Defaults to "system"
    pub initiator: Option<String>,
    pub priority: Priority,
}

impl StartOptions {
    pub fn initiated_by(initiator: impl Into<String>) -> Self {
        Self {
            initiator: Some(initiator.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub status: InstanceStatus,
    pub current_step_index: usize,
    pub data: DataMap,
    pub context: InstanceContext,
    pub history: Vec<HistoryEntry>,
    pub errors: Vec<ErrorEntry>,
}

impl WorkflowInstance {
    pub fn new(definition_id: &str, data: DataMap, options: StartOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition_id.to_string(),
            status: InstanceStatus::Running,
            current_step_index: 0,
            data,
            context: InstanceContext {
                start_time: Utc::now(),
                end_time: None,
                initiator: options.initiator.unwrap_or_else(|| "system".to_string()),
                priority: options.priority,
            },
            history: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Number of recorded failures for the step at `step_index`.
    pub fn failures_at(&self, step_index: usize) -> usize {
        self.errors.iter().filter(|e| e.step_index == step_index).count()
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: InstanceStatus) -> bool {
        if !self.is_running() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.context.end_time = Some(Utc::now());
        true
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.context
            .end_time
            .map(|end| (end - self.context.start_time).num_milliseconds())
    }
}
