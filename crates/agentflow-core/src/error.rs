//! Error types for the orchestration core.
//!
//! `WorkflowError` is what the engine and the system surface to callers.
//! `BusError` stays inside the event bus API, and `AgentError` travels over
//! the agent-response contract as serialized JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Transform failed: {0}")]
    TransformFailed(String),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Workflow system is not initialized")]
    NotInitialized,

    #[error("Workflow instance {instance_id} failed at step '{step_name}': {source}")]
    StepFailed {
        instance_id: String,
        step_name: String,
        #[source]
        source: Box<WorkflowError>,
    },
}

impl WorkflowError {
    /// Instance id carried by a terminal failure, if any.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            WorkflowError::StepFailed { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }

    /// The innermost cause, unwrapping `StepFailed`.
    pub fn root_cause(&self) -> &WorkflowError {
        match self {
            WorkflowError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Request on '{event}' timed out after {timeout_ms}ms")]
    Timeout { event: String, timeout_ms: u64 },

    /// The responder answered with an error payload.
    #[error("Responder returned an error: {0}")]
    Responder(serde_json::Value),

    #[error("Handler error: {0}")]
    Handler(String),
}

/// Failure reported by the agent registry, carried over the bus as
/// `{"kind": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),
}

impl From<AgentError> for WorkflowError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::AgentNotFound(name) => WorkflowError::AgentNotFound(name),
            AgentError::ActionFailed(msg) => WorkflowError::ActionFailed(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Failed to parse condition '{source_text}': {message}")]
    Parse { source_text: String, message: String },

    #[error("Field '{0}' is missing")]
    MissingField(String),

    #[error("Cannot compare {left} with {right} using '{op}'")]
    IncompatibleTypes {
        left: String,
        right: String,
        op: String,
    },

    #[error("Unknown condition reference '{0}'")]
    UnknownReference(String),
}
