//! WorkflowSystem - composition root of the orchestration core.
//!
//! The system:
//!   1. Owns one event bus and one engine bound to it
//!   2. Registers the built-in workflow catalogue on `init`
//!   3. Routes `agent.request` events to the agent invoker and answers them
//!   4. Observes terminal workflow events
//!   5. Exposes lifecycle, status, health and cleanup to the application
//!
//! There is no global instance: construct one at startup and share it.

pub mod catalogue;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::{AgentInvoker, AgentRequest, AgentResponse};
use crate::config::SystemConfig;
use crate::error::{BusError, WorkflowError};
use crate::events::{BusMetrics, Event, EventBus, EventFilter, PublishOptions, SubscriptionMetadata};
use crate::health::{ComponentHealth, HealthStatus};
use crate::workflow::context::DataMap;
use crate::workflow::engine::{
    WorkflowEngine, AGENT_REQUEST_EVENT, AGENT_RESPONSE_EVENT, WORKFLOW_COMPLETED, WORKFLOW_FAILED,
    WORKFLOW_STOPPED,
};
use crate::workflow::instance::{StartOptions, WorkflowInstance};
use crate::workflow::schema::WorkflowDefinition;

const SYSTEM_ID: &str = "workflow-system";
const RECENT_EVENT_LIMIT: usize = 20;

// ─── Reports ──────────────────────────────────────────────────────────────

/// Bus statistics plus the most recent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub metrics: BusMetrics,
    pub recent_events: Vec<Event>,
}

/// Aggregated health of the system and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub initialized: bool,
    pub engine: ComponentHealth,
    pub event_bus: ComponentHealth,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub events_pruned: usize,
    pub instances_evicted: usize,
}

// ─── System ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct SystemState {
    initialized: bool,
    subscriptions: Vec<String>,
}

pub struct WorkflowSystem {
    bus: EventBus,
    engine: WorkflowEngine,
    agents: Arc<dyn AgentInvoker>,
    config: SystemConfig,
    state: Mutex<SystemState>,
}

impl WorkflowSystem {
    pub fn new(agents: Arc<dyn AgentInvoker>) -> Self {
        Self::with_config(agents, SystemConfig::default())
    }

    pub fn with_config(agents: Arc<dyn AgentInvoker>, config: SystemConfig) -> Self {
        let bus = EventBus::with_config(config.bus.clone());
        let engine = WorkflowEngine::with_config(bus.clone(), config.engine.clone());
        Self {
            bus,
            engine,
            agents,
            config,
            state: Mutex::new(SystemState::default()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Register the built-in catalogue and start routing agent requests.
    /// Calling it again is a no-op.
    pub async fn init(&self) -> Result<(), WorkflowError> {
        if self.is_initialized() {
            return Ok(());
        }

        for definition in catalogue::builtin_workflows() {
            let id = definition.id.clone();
            self.engine.register_workflow(&id, definition).await?;
        }

        let mut subscriptions = vec![self.subscribe_agent_requests()];
        for event_name in [WORKFLOW_COMPLETED, WORKFLOW_FAILED, WORKFLOW_STOPPED] {
            subscriptions.push(self.bus.subscribe(
                event_name,
                log_terminal_event,
                SubscriptionMetadata::for_agent(SYSTEM_ID),
            ));
        }

        let mut state = self.state.lock();
        if state.initialized {
            // lost a race with a concurrent init
            for id in &subscriptions {
                self.bus.unsubscribe(id);
            }
            return Ok(());
        }
        state.subscriptions = subscriptions;
        state.initialized = true;
        tracing::info!(
            "[WorkflowSystem] Initialized with {} built-in workflows",
            catalogue::builtin_workflows().len()
        );
        Ok(())
    }

    /// Stop routing agent requests and stop every running instance.
    pub async fn shutdown(&self) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.initialized = false;
            std::mem::take(&mut state.subscriptions)
        };
        for id in &subscriptions {
            self.bus.unsubscribe(id);
        }

        let mut stopped = 0;
        for instance in self.engine.get_running_instances().await {
            if matches!(self.engine.stop_workflow(&instance.id).await, Ok(true)) {
                stopped += 1;
            }
        }
        tracing::info!(
            "[WorkflowSystem] Shut down ({} running instance(s) stopped)",
            stopped
        );
    }

    fn subscribe_agent_requests(&self) -> String {
        let agents = self.agents.clone();
        let bus = self.bus.clone();
        self.bus.subscribe(
            AGENT_REQUEST_EVENT,
            move |event: &Event| {
                let request: AgentRequest = serde_json::from_value(event.payload.clone())
                    .map_err(|e| BusError::Handler(format!("malformed agent request: {}", e)))?;
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    BusError::Handler("agent request published outside a tokio runtime".to_string())
                })?;
                let reply_to = event.metadata.reply_to.clone();
                let agents = agents.clone();
                let bus = bus.clone();
                runtime.spawn(route_agent_request(agents, bus, request, reply_to));
                Ok(())
            },
            SubscriptionMetadata::for_agent(SYSTEM_ID),
        )
    }

    // ─── Workflows ──────────────────────────────────────────────────────

    /// Register an application-defined workflow next to the built-ins.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        let id = definition.id.clone();
        self.engine.register_workflow(&id, definition).await
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        self.engine.get_workflows().await
    }

    /// Run a workflow to completion; see `WorkflowEngine::start_workflow`.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        data: DataMap,
        options: StartOptions,
    ) -> Result<String, WorkflowError> {
        if !self.is_initialized() {
            return Err(WorkflowError::NotInitialized);
        }
        self.engine.start_workflow(workflow_id, data, options).await
    }

    pub async fn start_content_creation_workflow(
        &self,
        content_data: DataMap,
        initiator: &str,
    ) -> Result<String, WorkflowError> {
        self.start_workflow(
            catalogue::CONTENT_CREATION,
            content_data,
            StartOptions::initiated_by(initiator),
        )
        .await
    }

    pub async fn start_user_behavior_analysis(&self, user_id: &str) -> Result<String, WorkflowError> {
        self.start_workflow(
            catalogue::USER_BEHAVIOR_ANALYSIS,
            data_from(json!({ "userId": user_id })),
            StartOptions::initiated_by(user_id),
        )
        .await
    }

    pub async fn start_publishing_workflow(
        &self,
        content_id: &str,
        platforms: &[String],
    ) -> Result<String, WorkflowError> {
        self.start_workflow(
            catalogue::CONTENT_PUBLISHING,
            data_from(json!({ "contentId": content_id, "platforms": platforms })),
            StartOptions::default(),
        )
        .await
    }

    pub async fn start_trending_content_workflow(&self, category: &str) -> Result<String, WorkflowError> {
        self.start_workflow(
            catalogue::TRENDING_CONTENT,
            data_from(json!({ "category": category })),
            StartOptions::default(),
        )
        .await
    }

    pub async fn start_content_optimization(&self, content_id: &str) -> Result<String, WorkflowError> {
        self.start_workflow(
            catalogue::CONTENT_OPTIMIZATION,
            data_from(json!({ "contentId": content_id })),
            StartOptions::default(),
        )
        .await
    }

    pub async fn get_workflow_status(&self, instance_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        self.engine.get_instance_status(instance_id).await
    }

    pub async fn stop_workflow(&self, instance_id: &str) -> Result<bool, WorkflowError> {
        self.engine.stop_workflow(instance_id).await
    }

    // ─── Observability ──────────────────────────────────────────────────

    pub fn get_event_stats(&self) -> EventStats {
        EventStats {
            metrics: self.bus.get_metrics(),
            recent_events: self.bus.get_event_history(&EventFilter {
                limit: Some(RECENT_EVENT_LIMIT),
                ..Default::default()
            }),
        }
    }

    pub async fn health_check(&self) -> SystemHealth {
        let initialized = self.is_initialized();
        let engine = self.engine.health_check().await;
        let event_bus = self.bus.health_check();
        let components = engine.status.worst(event_bus.status);
        SystemHealth {
            status: if initialized {
                components
            } else {
                components.worst(HealthStatus::Degraded)
            },
            initialized,
            engine,
            event_bus,
            timestamp: Utc::now(),
        }
    }

    /// Cleanup with the configured maximum age.
    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_older_than(Duration::from_secs(self.config.cleanup_max_age_secs))
            .await
    }

    /// Drop bus history and finished instances older than `max_age`.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> CleanupReport {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let report = CleanupReport {
            events_pruned: self.bus.prune_history(cutoff),
            instances_evicted: self.engine.evict_finished(cutoff).await,
        };
        tracing::info!(
            "[WorkflowSystem] Cleanup pruned {} event(s), evicted {} instance(s)",
            report.events_pruned,
            report.instances_evicted
        );
        report
    }
}

/// Invoke the agent for one request and publish its outcome.
async fn route_agent_request(
    agents: Arc<dyn AgentInvoker>,
    bus: EventBus,
    request: AgentRequest,
    reply_to: Option<String>,
) {
    tracing::debug!(
        "[WorkflowSystem] {}.{} for step '{}' of instance {}",
        request.agent,
        request.action,
        request.step_name,
        request.instance_id
    );
    let outcome = agents
        .invoke(&request.agent, &request.action, request.params.clone())
        .await;
    if let Err(ref e) = outcome {
        tracing::warn!(
            "[WorkflowSystem] Agent '{}' failed on '{}': {}",
            request.agent,
            request.action,
            e
        );
    }

    let response = AgentResponse::new(&request, &outcome);
    if let Some(reply_to) = reply_to {
        let outcome = outcome.map_err(|e| {
            serde_json::to_value(&e).unwrap_or_else(|_| Value::String(e.to_string()))
        });
        bus.respond(&reply_to, outcome);
    }
    match serde_json::to_value(&response) {
        Ok(payload) => {
            bus.publish(
                AGENT_RESPONSE_EVENT,
                payload,
                PublishOptions::from_sender(request.agent.clone()),
            );
        }
        Err(e) => tracing::warn!("[WorkflowSystem] Failed to encode agent response: {}", e),
    }
}

fn log_terminal_event(event: &Event) -> Result<(), BusError> {
    let instance_id = event.payload["instanceId"].as_str().unwrap_or("?");
    let workflow_id = event.payload["workflowId"].as_str().unwrap_or("?");
    match event.payload.get("error").and_then(Value::as_str) {
        Some(error) => tracing::warn!(
            "[WorkflowSystem] {} ({} / {}): {}",
            event.name,
            workflow_id,
            instance_id,
            error
        ),
        None => tracing::info!("[WorkflowSystem] {} ({} / {})", event.name, workflow_id, instance_id),
    }
    Ok(())
}

fn data_from(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        _ => DataMap::new(),
    }
}
