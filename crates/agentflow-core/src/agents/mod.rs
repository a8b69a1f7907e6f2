//! Agent invocation contract and the default in-memory registry.
//!
//! The engine never calls agents directly: it publishes an `AgentRequest` on
//! the bus and the system routes it to an `AgentInvoker`. Agents themselves
//! live outside this crate and plug in through the `Agent` trait.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;
use crate::workflow::context::DataMap;

/// Payload of an `agent.request` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub instance_id: String,
    pub step_name: String,
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub params: DataMap,
}

/// Payload of an `agent.response` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub instance_id: String,
    pub step_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

impl AgentResponse {
    pub fn new(request: &AgentRequest, outcome: &Result<Value, AgentError>) -> Self {
        let (result, error) = match outcome {
            Ok(v) => (Some(v.clone()), None),
            Err(e) => (None, Some(e.clone())),
        };
        Self {
            instance_id: request.instance_id.clone(),
            step_name: request.step_name.clone(),
            result,
            error,
        }
    }
}

/// Opaque capability the orchestration core uses to run agent actions.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, agent_name: &str, action: &str, params: DataMap) -> Result<Value, AgentError>;
}

/// A named worker that performs actions.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn perform(&self, action: &str, params: DataMap) -> Result<Value, AgentError>;
}

type AgentFn = Arc<dyn Fn(String, DataMap) -> BoxFuture<'static, Result<Value, AgentError>> + Send + Sync>;

/// Adapts an async closure into an `Agent`.
///
/// ```ignore
/// let writer = FnAgent::new("writer", |action, params| async move {
///     Ok(serde_json::json!({ "draft": format!("{} {:?}", action, params) }))
/// });
/// ```
pub struct FnAgent {
    name: String,
    handler: AgentFn,
}

impl FnAgent {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String, DataMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |action, params| handler(action, params).boxed()),
        }
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&self, action: &str, params: DataMap) -> Result<Value, AgentError> {
        (self.handler)(action.to_string(), params).await
    }
}

/// Name-keyed agent registry.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own name, replacing any previous one.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        if self.agents.write().insert(name.clone(), agent).is_some() {
            tracing::warn!("[AgentRegistry] Replaced agent '{}'", name);
        }
    }

    pub fn with_agent(self, agent: impl Agent + 'static) -> Self {
        self.register(Arc::new(agent));
        self
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.agents.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl AgentInvoker for AgentRegistry {
    async fn invoke(&self, agent_name: &str, action: &str, params: DataMap) -> Result<Value, AgentError> {
        let agent = self
            .get(agent_name)
            .ok_or_else(|| AgentError::AgentNotFound(agent_name.to_string()))?;
        agent.perform(action, params).await
    }
}
