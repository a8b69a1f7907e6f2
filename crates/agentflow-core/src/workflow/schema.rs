//! Schema types for workflow definitions.
//!
//! Definitions are normally built in code, but they also round-trip through
//! YAML/JSON:
//!
//! ```yaml
//! id: content-review
//! name: "Content Review"
//! retryPolicy: { maxRetries: 1, delayMs: 250 }
//! conditions:
//!   isLong: { expr: "wordCount > 1500" }
//! steps:
//!   - name: analyze
//!     type: agent
//!     agentName: content-analyzer
//!     action: analyze
//!     parameters: { depth: full }
//!   - name: long-form
//!     type: condition
//!     condition: { ref: isLong }
//!     onTrue: summarize
//!   - name: tag
//!     type: agent
//!     agentName: tagger
//!     action: tag
//!     onError: continue
//!   - name: summarize
//!     type: agent
//!     agentName: summarizer
//!     action: summarize
//!     when: { expr: "language == 'en'" }
//! ```

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::workflow::condition::Condition;
use crate::workflow::context::DataMap;
use crate::workflow::transform::TransformOp;

/// What to do once a step's retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Fail the instance (default)
    #[default]
    Fail,
    /// Record the error and move on to the next step
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self { max_retries, delay_ms }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self::new(0, 0)
    }
}

/// The kind-specific part of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    #[serde(rename_all = "camelCase")]
    Agent {
        agent_name: String,
        action: String,
        #[serde(default)]
        parameters: DataMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Condition {
        condition: Condition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_true: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_false: Option<String>,
    },
    Parallel { steps: Vec<WorkflowStep> },
    #[serde(rename_all = "camelCase")]
    Delay { delay_ms: u64 },
    Transform { script: Vec<TransformOp> },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Condition { .. } => "condition",
            Self::Parallel { .. } => "parallel",
            Self::Delay { .. } => "delay",
            Self::Transform { .. } => "transform",
        }
    }
}

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique within the definition; branch targets refer to it
    pub name: String,

    /// Guard: the step is skipped when this evaluates false
    #[serde(default, rename = "when", skip_serializing_if = "Option::is_none")]
    pub guard: Option<Condition>,

    /// Overrides the definition's retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default)]
    pub on_error: OnError,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl WorkflowStep {
    fn with_kind(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            guard: None,
            retry_policy: None,
            on_error: OnError::Fail,
            kind,
        }
    }

    pub fn agent(name: impl Into<String>, agent_name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            StepKind::Agent {
                agent_name: agent_name.into(),
                action: action.into(),
                parameters: DataMap::new(),
                timeout_ms: None,
            },
        )
    }

    pub fn condition(
        name: impl Into<String>,
        condition: Condition,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> Self {
        Self::with_kind(
            name,
            StepKind::Condition {
                condition,
                on_true: on_true.map(str::to_string),
                on_false: on_false.map(str::to_string),
            },
        )
    }

    pub fn parallel(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self::with_kind(name, StepKind::Parallel { steps })
    }

    pub fn delay(name: impl Into<String>, delay_ms: u64) -> Self {
        Self::with_kind(name, StepKind::Delay { delay_ms })
    }

    pub fn transform(name: impl Into<String>, script: Vec<TransformOp>) -> Self {
        Self::with_kind(name, StepKind::Transform { script })
    }

    /// Set agent parameters from a JSON object. Ignored for other kinds.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        if let (StepKind::Agent { parameters, .. }, serde_json::Value::Object(map)) = (&mut self.kind, params) {
            *parameters = map;
        }
        self
    }

    /// Set the agent call timeout. Ignored for other kinds.
    pub fn with_timeout(mut self, ms: u64) -> Self {
        if let StepKind::Agent { timeout_ms, .. } = &mut self.kind {
            *timeout_ms = Some(ms);
        }
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.on_error = OnError::Continue;
        self
    }

    pub fn when(mut self, guard: Condition) -> Self {
        self.guard = Some(guard);
        self
    }
}

/// Top-level workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<WorkflowStep>,

    /// Named conditions, referenced with `Condition::Ref`
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,

    /// Default retry policy; the engine's default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Default agent step timeout; the engine's default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            conditions: BTreeMap::new(),
            retry_policy: None,
            timeout_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_condition(mut self, name: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(name.into(), condition);
        self
    }

    /// Parse a workflow definition from a YAML (or JSON) string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse workflow YAML: {}", e))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read workflow file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Index of the top-level step named `name`.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Structural checks: id, non-empty steps, unique names, branch targets.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |msg: String| WorkflowError::InvalidDefinition(format!("{}: {}", self.id, msg));

        if self.id.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition("workflow id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("no steps".to_string()));
        }

        let mut seen = HashSet::new();
        let mut pending = self.steps.iter().collect::<Vec<_>>();
        while let Some(step) = pending.pop() {
            if step.name.trim().is_empty() {
                return Err(invalid("step with empty name".to_string()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }
            match &step.kind {
                StepKind::Parallel { steps } => {
                    if steps.is_empty() {
                        return Err(invalid(format!("parallel step '{}' has no steps", step.name)));
                    }
                    pending.extend(steps.iter());
                }
                StepKind::Condition { on_true, on_false, .. } => {
                    for target in [on_true, on_false].into_iter().flatten() {
                        if self.step_index(target).is_none() {
                            return Err(invalid(format!(
                                "step '{}' branches to unknown step '{}'",
                                step.name, target
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Compile every expression condition in place.
    ///
    /// Expressions that fail to parse are left as written (they evaluate to
    /// false at runtime); their errors are returned for logging.
    pub fn compile_conditions(&mut self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut compile = |cond: &mut Condition, origin: &str| match cond.compile() {
            Ok(compiled) => *cond = compiled,
            Err(e) => problems.push(format!("{}: {}", origin, e)),
        };

        for (name, cond) in self.conditions.iter_mut() {
            compile(cond, &format!("condition '{}'", name));
        }

        let mut pending: Vec<&mut WorkflowStep> = self.steps.iter_mut().collect();
        while let Some(step) = pending.pop() {
            let origin = format!("step '{}'", step.name);
            if let Some(guard) = step.guard.as_mut() {
                compile(guard, &origin);
            }
            match &mut step.kind {
                StepKind::Condition { condition, .. } => compile(condition, &origin),
                StepKind::Parallel { steps } => pending.extend(steps.iter_mut()),
                _ => {}
            }
        }
        problems
    }

    /// Nested parallel branches that set `retryPolicy` or `onError`.
    ///
    /// Branches run under the parallel step's own policy, so these settings
    /// have no effect.
    pub fn ignored_branch_settings(&self) -> Vec<String> {
        let mut ignored = Vec::new();
        let mut pending: Vec<(&WorkflowStep, &str)> = Vec::new();
        for step in &self.steps {
            if let StepKind::Parallel { steps } = &step.kind {
                pending.extend(steps.iter().map(|s| (s, step.name.as_str())));
            }
        }
        while let Some((step, parent)) = pending.pop() {
            if step.retry_policy.is_some() {
                ignored.push(format!("step '{}' in '{}': retryPolicy", step.name, parent));
            }
            if step.on_error != OnError::Fail {
                ignored.push(format!("step '{}' in '{}': onError", step.name, parent));
            }
            if let StepKind::Parallel { steps } = &step.kind {
                pending.extend(steps.iter().map(|s| (s, parent)));
            }
        }
        ignored.sort();
        ignored
    }
}
