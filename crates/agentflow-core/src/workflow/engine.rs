//! Workflow Engine - runs workflow definitions over the event bus.
//!
//! The engine:
//! 1. Keeps registered definitions and every instance it has started
//! 2. Executes an instance's steps in order, honouring guards and branches
//! 3. Dispatches agent steps as `agent.request` bus requests and waits for
//!    the correlated response
//! 4. Applies the retry / continue / fail policy on step errors
//! 5. Publishes lifecycle events (`workflow.*`) for observers
//!
//! Each instance is driven by exactly one execution loop. Locks are never
//! held across an `.await` or while publishing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::agents::AgentRequest;
use crate::config::EngineConfig;
use crate::error::{AgentError, BusError, WorkflowError};
use crate::events::{EventBus, PublishOptions};
use crate::health::{ComponentHealth, HealthStatus};
use crate::workflow::condition::Condition;
use crate::workflow::context::{merge_result, resolve_value, DataMap};
use crate::workflow::instance::{
    ErrorEntry, HistoryEntry, InstanceStatus, StartOptions, WorkflowInstance,
};
use crate::workflow::schema::{OnError, StepKind, WorkflowDefinition, WorkflowStep};
use crate::workflow::transform;

pub const AGENT_REQUEST_EVENT: &str = "agent.request";
pub const AGENT_RESPONSE_EVENT: &str = "agent.response";

pub const WORKFLOW_STARTED: &str = "workflow.started";
pub const WORKFLOW_STEP_COMPLETED: &str = "workflow.step.completed";
pub const WORKFLOW_STEP_SKIPPED: &str = "workflow.step.skipped";
pub const WORKFLOW_STEP_FAILED: &str = "workflow.step.failed";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";
pub const WORKFLOW_STOPPED: &str = "workflow.stopped";

const ENGINE_SENDER: &str = "workflow-engine";

/// Outcome of one successful step execution.
struct StepOutput {
    result: Value,
    /// Transform results replace the data context instead of merging
    replaces_data: bool,
    /// Branch target chosen by a condition step
    next_step: Option<String>,
}

impl StepOutput {
    fn merge(result: Value) -> Self {
        Self {
            result,
            replaces_data: false,
            next_step: None,
        }
    }
}

/// Instance counts by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub registered_workflows: usize,
    pub total_instances: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

struct EngineInner {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    instances: RwLock<HashMap<String, WorkflowInstance>>,
}

/// Cloneable handle to the workflow engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
    bus: EventBus,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(bus: EventBus) -> Self {
        Self::with_config(bus, EngineConfig::default())
    }

    pub fn with_config(bus: EventBus, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                definitions: RwLock::new(HashMap::new()),
                instances: RwLock::new(HashMap::new()),
            }),
            bus,
            config,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ─── Definitions ────────────────────────────────────────────────────

    /// Validate, compile and store a definition under `id`.
    ///
    /// An existing definition with the same id is replaced; instances that
    /// are already running keep the definition they started with.
    pub async fn register_workflow(
        &self,
        id: &str,
        mut definition: WorkflowDefinition,
    ) -> Result<(), WorkflowError> {
        definition.id = id.to_string();
        definition.validate()?;
        for problem in definition.compile_conditions() {
            tracing::warn!(
                "[WorkflowEngine] Workflow '{}': {} (will evaluate as false)",
                id,
                problem
            );
        }
        for setting in definition.ignored_branch_settings() {
            tracing::warn!(
                "[WorkflowEngine] Workflow '{}': {} is ignored inside a parallel step",
                id,
                setting
            );
        }

        let mut definitions = self.inner.definitions.write().await;
        if definitions.insert(id.to_string(), Arc::new(definition)).is_some() {
            tracing::warn!("[WorkflowEngine] Overwrote workflow definition '{}'", id);
        } else {
            tracing::info!("[WorkflowEngine] Registered workflow '{}'", id);
        }
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .definitions
            .read()
            .await
            .get(id)
            .map(|d| d.as_ref().clone())
    }

    /// All registered definitions, sorted by id.
    pub async fn get_workflows(&self) -> Vec<WorkflowDefinition> {
        let definitions = self.inner.definitions.read().await;
        let mut all: Vec<WorkflowDefinition> =
            definitions.values().map(|d| d.as_ref().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    // ─── Execution ──────────────────────────────────────────────────────

    /// Start an instance and drive it to a terminal state.
    ///
    /// Returns the instance id once the instance completes (or is stopped).
    /// A step failure that is not continued past fails the call with
    /// `WorkflowError::StepFailed`, which carries the instance id.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        initial_data: DataMap,
        options: StartOptions,
    ) -> Result<String, WorkflowError> {
        let (instance_id, definition) = self
            .create_instance(workflow_id, initial_data, options)
            .await?;
        self.run_instance(&instance_id, definition).await?;
        Ok(instance_id)
    }

    /// Start an instance on a background task and return its id immediately.
    pub async fn spawn_workflow(
        &self,
        workflow_id: &str,
        initial_data: DataMap,
        options: StartOptions,
    ) -> Result<(String, JoinHandle<Result<String, WorkflowError>>), WorkflowError> {
        let (instance_id, definition) = self
            .create_instance(workflow_id, initial_data, options)
            .await?;
        let engine = self.clone();
        let id = instance_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = engine.run_instance(&id, definition).await;
            outcome.map(|_| id)
        });
        Ok((instance_id, handle))
    }

    async fn create_instance(
        &self,
        workflow_id: &str,
        initial_data: DataMap,
        options: StartOptions,
    ) -> Result<(String, Arc<WorkflowDefinition>), WorkflowError> {
        let definition = self
            .inner
            .definitions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::DefinitionNotFound(workflow_id.to_string()))?;

        let instance = WorkflowInstance::new(workflow_id, initial_data, options);
        let instance_id = instance.id.clone();
        let initiator = instance.context.initiator.clone();
        self.inner
            .instances
            .write()
            .await
            .insert(instance_id.clone(), instance);

        tracing::info!(
            "[WorkflowEngine] Started workflow '{}' as instance {} (initiator: {})",
            workflow_id,
            instance_id,
            initiator
        );
        self.emit(
            WORKFLOW_STARTED,
            json!({
                "instanceId": instance_id,
                "workflowId": workflow_id,
                "initiator": initiator,
            }),
        );
        Ok((instance_id, definition))
    }

    /// The execution loop of one instance.
    async fn run_instance(
        &self,
        instance_id: &str,
        definition: Arc<WorkflowDefinition>,
    ) -> Result<(), WorkflowError> {
        let default_retry = definition.retry_policy.unwrap_or(self.config.default_retry);

        loop {
            let (index, data) = {
                let instances = self.inner.instances.read().await;
                let instance = instances
                    .get(instance_id)
                    .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;
                if !instance.is_running() {
                    return Ok(());
                }
                (instance.current_step_index, instance.data.clone())
            };

            let Some(step) = definition.steps.get(index) else {
                break;
            };

            if let Some(guard) = &step.guard {
                if !self.check_condition(guard, &data, &definition, instance_id, &step.name) {
                    if self.advance(instance_id, index + 1).await {
                        tracing::debug!(
                            "[WorkflowEngine] Instance {} skipped step '{}'",
                            instance_id,
                            step.name
                        );
                        self.emit(
                            WORKFLOW_STEP_SKIPPED,
                            json!({
                                "instanceId": instance_id,
                                "workflowId": definition.id,
                                "stepIndex": index,
                                "stepName": step.name,
                            }),
                        );
                    }
                    continue;
                }
            }

            tracing::debug!(
                "[WorkflowEngine] Instance {} executing step {}/{} '{}' ({})",
                instance_id,
                index + 1,
                definition.steps.len(),
                step.name,
                step.kind.as_str()
            );

            match self.execute_step(instance_id, &definition, step, &data).await {
                Ok(output) => {
                    let next = output
                        .next_step
                        .as_deref()
                        .and_then(|target| definition.step_index(target))
                        .unwrap_or(index + 1);
                    {
                        let mut instances = self.inner.instances.write().await;
                        let instance = instances
                            .get_mut(instance_id)
                            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;
                        if !instance.is_running() {
                            tracing::info!(
                                "[WorkflowEngine] Discarding result of step '{}': instance {} is {}",
                                step.name,
                                instance_id,
                                instance.status.as_str()
                            );
                            return Ok(());
                        }
                        match (&output.result, output.replaces_data) {
                            (Value::Object(map), true) => instance.data = map.clone(),
                            (result, _) => merge_result(&mut instance.data, result),
                        }
                        instance.history.push(HistoryEntry {
                            step_index: index,
                            step_name: step.name.clone(),
                            result: output.result.clone(),
                            timestamp: Utc::now(),
                        });
                        instance.current_step_index = next;
                    }
                    self.emit(
                        WORKFLOW_STEP_COMPLETED,
                        json!({
                            "instanceId": instance_id,
                            "workflowId": definition.id,
                            "stepIndex": index,
                            "stepName": step.name,
                            "result": output.result,
                        }),
                    );
                }
                Err(err) => {
                    let failures = {
                        let mut instances = self.inner.instances.write().await;
                        let instance = instances
                            .get_mut(instance_id)
                            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))?;
                        if !instance.is_running() {
                            tracing::info!(
                                "[WorkflowEngine] Discarding failure of step '{}': instance {} is {}",
                                step.name,
                                instance_id,
                                instance.status.as_str()
                            );
                            return Ok(());
                        }
                        instance.errors.push(ErrorEntry {
                            step_index: index,
                            step_name: step.name.clone(),
                            error: err.to_string(),
                            timestamp: Utc::now(),
                        });
                        instance.failures_at(index)
                    };
                    self.emit(
                        WORKFLOW_STEP_FAILED,
                        json!({
                            "instanceId": instance_id,
                            "workflowId": definition.id,
                            "stepIndex": index,
                            "stepName": step.name,
                            "attempt": failures,
                            "error": err.to_string(),
                        }),
                    );

                    let policy = step.retry_policy.unwrap_or(default_retry);
                    if failures <= policy.max_retries as usize {
                        tracing::warn!(
                            "[WorkflowEngine] Step '{}' of instance {} failed (attempt {}/{}), retrying in {}ms: {}",
                            step.name,
                            instance_id,
                            failures,
                            policy.max_retries + 1,
                            policy.delay_ms,
                            err
                        );
                        if policy.delay_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
                        }
                        continue;
                    }

                    if step.on_error == OnError::Continue {
                        tracing::warn!(
                            "[WorkflowEngine] Step '{}' of instance {} failed, continuing: {}",
                            step.name,
                            instance_id,
                            err
                        );
                        self.advance(instance_id, index + 1).await;
                        continue;
                    }

                    tracing::error!(
                        "[WorkflowEngine] Instance {} failed at step '{}': {}",
                        instance_id,
                        step.name,
                        err
                    );
                    self.finish(instance_id, &definition.id, InstanceStatus::Failed, Some(&err))
                        .await;
                    return Err(WorkflowError::StepFailed {
                        instance_id: instance_id.to_string(),
                        step_name: step.name.clone(),
                        source: Box::new(err),
                    });
                }
            }
        }

        self.finish(instance_id, &definition.id, InstanceStatus::Completed, None)
            .await;
        Ok(())
    }

    fn execute_step<'a>(
        &'a self,
        instance_id: &'a str,
        definition: &'a WorkflowDefinition,
        step: &'a WorkflowStep,
        data: &'a DataMap,
    ) -> BoxFuture<'a, Result<StepOutput, WorkflowError>> {
        Box::pin(async move {
            match &step.kind {
                StepKind::Agent {
                    agent_name,
                    action,
                    parameters,
                    timeout_ms,
                } => {
                    let timeout_ms = timeout_ms
                        .or(definition.timeout_ms)
                        .unwrap_or(self.config.default_timeout_ms);
                    let request = AgentRequest {
                        instance_id: instance_id.to_string(),
                        step_name: step.name.clone(),
                        agent: agent_name.clone(),
                        action: action.clone(),
                        params: build_params(parameters, data),
                    };
                    let payload = serde_json::to_value(&request).map_err(|e| {
                        WorkflowError::ActionFailed(format!("failed to encode agent request: {}", e))
                    })?;

                    let result = self
                        .bus
                        .request_with(
                            AGENT_REQUEST_EVENT,
                            payload,
                            Some(timeout_ms),
                            PublishOptions::from_sender(ENGINE_SENDER),
                        )
                        .await
                        .map_err(|e| match e {
                            BusError::Timeout { .. } => WorkflowError::StepTimeout {
                                step: step.name.clone(),
                                timeout_ms,
                            },
                            BusError::Responder(err) => agent_error(err),
                            other => WorkflowError::Bus(other),
                        })?;
                    Ok(StepOutput::merge(result))
                }
                StepKind::Condition {
                    condition,
                    on_true,
                    on_false,
                } => {
                    let outcome =
                        self.check_condition(condition, data, definition, instance_id, &step.name);
                    Ok(StepOutput {
                        result: json!({ "conditionResult": outcome }),
                        replaces_data: false,
                        next_step: if outcome { on_true.clone() } else { on_false.clone() },
                    })
                }
                StepKind::Parallel { steps } => {
                    let branches = steps.iter().map(|nested| async move {
                        if let Some(guard) = &nested.guard {
                            if !self.check_condition(guard, data, definition, instance_id, &nested.name) {
                                return Ok(Value::Null);
                            }
                        }
                        self.execute_step(instance_id, definition, nested, data)
                            .await
                            .map(|output| output.result)
                    });
                    let results = futures::future::join_all(branches).await;
                    let parallel_results = results.into_iter().collect::<Result<Vec<Value>, _>>()?;
                    Ok(StepOutput::merge(json!({ "parallelResults": parallel_results })))
                }
                StepKind::Delay { delay_ms } => {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                    Ok(StepOutput::merge(json!({ "delayed": delay_ms })))
                }
                StepKind::Transform { script } => {
                    let new_data = transform::apply(script, data)?;
                    Ok(StepOutput {
                        result: Value::Object(new_data),
                        replaces_data: true,
                        next_step: None,
                    })
                }
            }
        })
    }

    /// Evaluate a condition; evaluation errors count as false.
    fn check_condition(
        &self,
        condition: &Condition,
        data: &DataMap,
        definition: &WorkflowDefinition,
        instance_id: &str,
        step_name: &str,
    ) -> bool {
        match condition.evaluate(data, &definition.conditions) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    "[WorkflowEngine] Condition of step '{}' in instance {} treated as false: {}",
                    step_name,
                    instance_id,
                    e
                );
                false
            }
        }
    }

    /// Move a running instance to `next`. Returns false if it is no longer running.
    async fn advance(&self, instance_id: &str, next: usize) -> bool {
        let mut instances = self.inner.instances.write().await;
        match instances.get_mut(instance_id) {
            Some(instance) if instance.is_running() => {
                instance.current_step_index = next;
                true
            }
            _ => false,
        }
    }

    async fn finish(
        &self,
        instance_id: &str,
        workflow_id: &str,
        status: InstanceStatus,
        error: Option<&WorkflowError>,
    ) -> bool {
        let event = match status {
            InstanceStatus::Completed => WORKFLOW_COMPLETED,
            InstanceStatus::Failed => WORKFLOW_FAILED,
            InstanceStatus::Stopped => WORKFLOW_STOPPED,
            InstanceStatus::Running => return false,
        };

        let finished = {
            let mut instances = self.inner.instances.write().await;
            instances
                .get_mut(instance_id)
                .map(|instance| instance.finish(status))
                .unwrap_or(false)
        };

        if finished {
            tracing::info!(
                "[WorkflowEngine] Instance {} of '{}' is {}",
                instance_id,
                workflow_id,
                status.as_str()
            );
            let mut payload = json!({
                "instanceId": instance_id,
                "workflowId": workflow_id,
            });
            if let Some(err) = error {
                payload["error"] = json!(err.to_string());
            }
            self.emit(event, payload);
        }
        finished
    }

    fn emit(&self, event_name: &str, payload: Value) {
        self.bus
            .publish(event_name, payload, PublishOptions::from_sender(ENGINE_SENDER));
    }

    // ─── Instance queries and control ───────────────────────────────────

    /// Snapshot of an instance, including partial history after a failure.
    pub async fn get_instance_status(&self, instance_id: &str) -> Result<WorkflowInstance, WorkflowError> {
        self.inner
            .instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))
    }

    /// Mark a running instance as stopped.
    ///
    /// An agent call already in flight is not interrupted; its result is
    /// discarded when it arrives. Returns false if the instance had already
    /// finished.
    pub async fn stop_workflow(&self, instance_id: &str) -> Result<bool, WorkflowError> {
        let workflow_id = self.get_instance_status(instance_id).await?.definition_id;
        Ok(self
            .finish(instance_id, &workflow_id, InstanceStatus::Stopped, None)
            .await)
    }

    pub async fn get_running_instances(&self) -> Vec<WorkflowInstance> {
        self.inner
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.is_running())
            .cloned()
            .collect()
    }

    pub async fn get_metrics(&self) -> EngineMetrics {
        let registered_workflows = self.inner.definitions.read().await.len();
        let instances = self.inner.instances.read().await;
        let mut metrics = EngineMetrics {
            registered_workflows,
            total_instances: instances.len(),
            ..Default::default()
        };
        for instance in instances.values() {
            match instance.status {
                InstanceStatus::Running => metrics.running += 1,
                InstanceStatus::Completed => metrics.completed += 1,
                InstanceStatus::Failed => metrics.failed += 1,
                InstanceStatus::Stopped => metrics.stopped += 1,
            }
        }
        metrics
    }

    pub async fn health_check(&self) -> ComponentHealth {
        ComponentHealth {
            status: HealthStatus::Healthy,
            details: serde_json::to_value(self.get_metrics().await).unwrap_or_default(),
        }
    }

    /// Remove finished instances that ended before `cutoff`.
    pub async fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut instances = self.inner.instances.write().await;
        let before = instances.len();
        instances.retain(|_, instance| {
            !(instance.status.is_terminal()
                && instance.context.end_time.is_some_and(|end| end < cutoff))
        });
        let evicted = before - instances.len();
        if evicted > 0 {
            tracing::info!("[WorkflowEngine] Evicted {} finished instance(s)", evicted);
        }
        evicted
    }
}

/// Step parameters (placeholders resolved) overlaid with the data context.
fn build_params(parameters: &DataMap, data: &DataMap) -> DataMap {
    let mut params: DataMap = parameters
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, data)))
        .collect();
    for (k, v) in data {
        params.insert(k.clone(), v.clone());
    }
    params
}

fn agent_error(payload: Value) -> WorkflowError {
    match serde_json::from_value::<AgentError>(payload.clone()) {
        Ok(err) => err.into(),
        Err(_) => WorkflowError::ActionFailed(match payload {
            Value::String(s) => s,
            other => other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, SubscriptionMetadata};
    use crate::workflow::condition::Condition;
    use crate::workflow::schema::RetryPolicy;
    use crate::workflow::transform::TransformOp;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn data(value: Value) -> DataMap {
        value.as_object().cloned().unwrap_or_default()
    }

    /// Answer agent requests synchronously with `handler`.
    fn serve<F>(bus: &EventBus, handler: F)
    where
        F: Fn(AgentRequest) -> Result<Value, AgentError> + Send + Sync + 'static,
    {
        let responder = bus.clone();
        bus.subscribe(
            AGENT_REQUEST_EVENT,
            move |event| {
                let request: AgentRequest = serde_json::from_value(event.payload.clone())
                    .map_err(|e| BusError::Handler(e.to_string()))?;
                let reply_to = event.metadata.reply_to.clone().unwrap_or_default();
                let outcome = handler(request).map_err(|e| serde_json::to_value(e).unwrap_or_default());
                responder.respond(&reply_to, outcome);
                Ok(())
            },
            SubscriptionMetadata::default(),
        );
    }

    /// Answer agent requests after `params.delayMs` milliseconds.
    fn serve_delayed(bus: &EventBus) {
        let responder = bus.clone();
        bus.subscribe(
            AGENT_REQUEST_EVENT,
            move |event| {
                let responder = responder.clone();
                let reply_to = event.metadata.reply_to.clone().unwrap_or_default();
                let delay = event.payload["params"]["delayMs"].as_u64().unwrap_or(0);
                let step = event.payload["stepName"].clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    responder.respond(&reply_to, Ok(json!({ "from": step })));
                });
                Ok(())
            },
            SubscriptionMetadata::default(),
        );
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(EventBus::new())
    }

    fn step_names(instance: &WorkflowInstance) -> Vec<String> {
        instance.history.iter().map(|h| h.step_name.clone()).collect()
    }

    #[tokio::test]
    async fn test_sequential_completion() {
        let engine = engine();
        serve(engine.bus(), |req| Ok(json!({ format!("{}Done", req.step_name): true })));

        let wf = WorkflowDefinition::new("seq", "Sequential")
            .with_step(WorkflowStep::agent("analyze", "analyzer", "analyze"))
            .with_step(WorkflowStep::agent("write", "writer", "write"))
            .with_step(WorkflowStep::agent("review", "reviewer", "review"));
        engine.register_workflow("seq", wf).await.unwrap();

        let id = engine
            .start_workflow("seq", data(json!({ "topic": "rust" })), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.current_step_index, 3);
        assert_eq!(step_names(&instance), vec!["analyze", "write", "review"]);
        assert_eq!(instance.data["analyzeDone"], json!(true));
        assert_eq!(instance.data["reviewDone"], json!(true));
        assert_eq!(instance.data["topic"], json!("rust"));
        assert!(instance.context.end_time.is_some());

        let completed = engine
            .bus()
            .get_event_history(&EventFilter::by_name(WORKFLOW_STEP_COMPLETED));
        assert_eq!(completed.len(), 3);
        assert_eq!(
            engine.bus().get_event_history(&EventFilter::by_name(WORKFLOW_COMPLETED)).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_instance() {
        let engine = engine();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        serve(engine.bus(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::ActionFailed("publisher offline".to_string()))
        });

        let wf = WorkflowDefinition::new("flaky", "Flaky").with_step(
            WorkflowStep::agent("publish", "publisher", "publish").with_retry(RetryPolicy::new(2, 0)),
        );
        engine.register_workflow("flaky", wf).await.unwrap();

        let err = engine
            .start_workflow("flaky", DataMap::new(), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), WorkflowError::ActionFailed(m) if m == "publisher offline"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let instance_id = err.instance_id().unwrap().to_string();
        let instance = engine.get_instance_status(&instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.errors.len(), 3);
        assert_eq!(instance.failures_at(0), 3);
        assert!(instance.history.is_empty());
        assert_eq!(
            engine.bus().get_event_history(&EventFilter::by_name(WORKFLOW_FAILED)).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let engine = engine();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        serve(engine.bus(), move |req| {
            if req.agent == "broken" {
                counter.fetch_add(1, Ordering::SeqCst);
                return Err(AgentError::AgentNotFound("broken".to_string()));
            }
            Ok(json!({ "ok": true }))
        });

        let wf = WorkflowDefinition::new("tolerant", "Tolerant")
            .with_step(WorkflowStep::agent("first", "good", "run"))
            .with_step(
                WorkflowStep::agent("optional", "broken", "run")
                    .with_retry(RetryPolicy::none())
                    .continue_on_error(),
            )
            .with_step(WorkflowStep::agent("last", "good", "run"));
        engine.register_workflow("tolerant", wf).await.unwrap();

        let id = engine
            .start_workflow("tolerant", DataMap::new(), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.errors.len(), 1);
        assert_eq!(instance.errors[0].step_index, 1);
        assert!(instance.errors[0].error.contains("broken"));
        assert_eq!(step_names(&instance), vec!["first", "last"]);
    }

    #[tokio::test]
    async fn test_condition_branch_skips_ahead() {
        let engine = engine();
        let called = Arc::new(Mutex::new(Vec::new()));
        let log = called.clone();
        serve(engine.bus(), move |req| {
            log.lock().push(req.step_name.clone());
            Ok(json!({ "approved": true }))
        });

        let wf = WorkflowDefinition::new("branch", "Branch")
            .with_step(WorkflowStep::agent("stepA", "reviewer", "review"))
            .with_step(WorkflowStep::condition(
                "check",
                Condition::expr("approved == true"),
                Some("stepC"),
                None,
            ))
            .with_step(WorkflowStep::agent("stepB", "editor", "rework"))
            .with_step(WorkflowStep::agent("stepC", "publisher", "publish"));
        engine.register_workflow("branch", wf).await.unwrap();

        let id = engine
            .start_workflow("branch", DataMap::new(), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();

        assert_eq!(*called.lock(), vec!["stepA", "stepC"]);
        assert_eq!(step_names(&instance), vec!["stepA", "check", "stepC"]);
        assert_eq!(instance.history[1].result, json!({ "conditionResult": true }));
        assert_eq!(instance.current_step_index, 4);
    }

    #[tokio::test]
    async fn test_false_branch_and_malformed_condition() {
        let engine = engine();
        serve(engine.bus(), |_| Ok(json!({})));

        let wf = WorkflowDefinition::new("lenient", "Lenient")
            .with_step(WorkflowStep::condition(
                "broken-check",
                Condition::expr("score >>> 3"),
                Some("done"),
                Some("fallback"),
            ))
            .with_step(WorkflowStep::agent("skipped", "x", "y"))
            .with_step(WorkflowStep::agent("fallback", "x", "y"))
            .with_step(WorkflowStep::delay("done", 0));
        engine.register_workflow("lenient", wf).await.unwrap();

        let id = engine
            .start_workflow("lenient", DataMap::new(), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();
        assert_eq!(step_names(&instance), vec!["broken-check", "fallback", "done"]);
        assert_eq!(instance.history[0].result["conditionResult"], json!(false));
    }

    #[tokio::test]
    async fn test_guard_skips_step() {
        let engine = engine();
        serve(engine.bus(), |_| Ok(json!({ "ran": true })));

        let wf = WorkflowDefinition::new("guarded", "Guarded")
            .with_condition("isPremium", Condition::expr("plan == 'premium'"))
            .with_step(WorkflowStep::agent("premium-only", "x", "y").when(Condition::Ref("isPremium".into())))
            .with_step(WorkflowStep::delay("after", 0));
        engine.register_workflow("guarded", wf).await.unwrap();

        let id = engine
            .start_workflow("guarded", data(json!({ "plan": "free" })), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();
        assert_eq!(step_names(&instance), vec!["after"]);
        assert!(!instance.data.contains_key("ran"));
        assert_eq!(
            engine.bus().get_event_history(&EventFilter::by_name(WORKFLOW_STEP_SKIPPED)).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_parallel_results_keep_declaration_order() {
        let engine = engine();
        serve_delayed(engine.bus());

        let wf = WorkflowDefinition::new("fan-out", "Fan out").with_step(WorkflowStep::parallel(
            "fetch",
            vec![
                WorkflowStep::agent("slow", "fetcher", "fetch").with_params(json!({ "delayMs": 60 })),
                WorkflowStep::agent("fast", "fetcher", "fetch").with_params(json!({ "delayMs": 5 })),
                WorkflowStep::agent("medium", "fetcher", "fetch").with_params(json!({ "delayMs": 30 })),
            ],
        ));
        engine.register_workflow("fan-out", wf).await.unwrap();

        let started = std::time::Instant::now();
        let id = engine
            .start_workflow("fan-out", DataMap::new(), StartOptions::default())
            .await
            .unwrap();
        let elapsed = started.elapsed();
        let instance = engine.get_instance_status(&id).await.unwrap();

        let results = instance.data["parallelResults"].as_array().cloned().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["from"], json!("slow"));
        assert_eq!(results[1]["from"], json!("fast"));
        assert_eq!(results[2]["from"], json!("medium"));
        // branches ran concurrently, not one after another
        assert!(elapsed < Duration::from_millis(60 + 5 + 30));
        assert_eq!(instance.history.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_failure_uses_parent_policy() {
        let engine = engine();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        serve(engine.bus(), move |req| {
            if req.step_name == "bad" {
                counter.fetch_add(1, Ordering::SeqCst);
                return Err(AgentError::ActionFailed("bad branch".to_string()));
            }
            Ok(json!(1))
        });

        let wf = WorkflowDefinition::new("par-fail", "Parallel failure")
            .with_step(
                WorkflowStep::parallel(
                    "fan",
                    vec![
                        WorkflowStep::agent("good", "x", "y"),
                        WorkflowStep::agent("bad", "x", "y"),
                    ],
                )
                .with_retry(RetryPolicy::new(1, 0))
                .continue_on_error(),
            )
            .with_step(WorkflowStep::delay("after", 0));
        engine.register_workflow("par-fail", wf).await.unwrap();

        let id = engine
            .start_workflow("par-fail", DataMap::new(), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(instance.errors.len(), 2);
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(step_names(&instance), vec!["after"]);
    }

    #[tokio::test]
    async fn test_step_timeout_is_retried() {
        let engine = engine();
        // nobody answers agent requests
        let wf = WorkflowDefinition::new("silent", "Silent").with_step(
            WorkflowStep::agent("ask", "ghost", "answer")
                .with_timeout(30)
                .with_retry(RetryPolicy::new(1, 0)),
        );
        engine.register_workflow("silent", wf).await.unwrap();

        let err = engine
            .start_workflow("silent", DataMap::new(), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            WorkflowError::StepTimeout { timeout_ms: 30, step } if step == "ask"
        ));
        let instance = engine
            .get_instance_status(err.instance_id().unwrap())
            .await
            .unwrap();
        assert_eq!(instance.errors.len(), 2);
        assert!(instance.errors.iter().all(|e| e.error.contains("timed out")));
    }

    #[tokio::test]
    async fn test_definition_timeout_is_default_for_steps() {
        let engine = engine();
        let wf = WorkflowDefinition::new("quick", "Quick")
            .with_timeout(20)
            .with_retry_policy(RetryPolicy::none())
            .with_step(WorkflowStep::agent("ask", "ghost", "answer"));
        engine.register_workflow("quick", wf).await.unwrap();

        let err = engine
            .start_workflow("quick", DataMap::new(), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), WorkflowError::StepTimeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_agent_params_merge_data_and_templates() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(None::<AgentRequest>));
        let slot = seen.clone();
        serve(engine.bus(), move |req| {
            *slot.lock() = Some(req);
            Ok(json!("plain result"))
        });

        let wf = WorkflowDefinition::new("params", "Params").with_step(
            WorkflowStep::agent("seo", "seo-optimizer", "optimize").with_params(json!({
                "headline": "About ${topic}",
                "limit": 10,
                "topic": "overridden by data",
            })),
        );
        engine.register_workflow("params", wf).await.unwrap();

        let id = engine
            .start_workflow("params", data(json!({ "topic": "tokio" })), StartOptions::default())
            .await
            .unwrap();

        let request = seen.lock().clone().unwrap();
        assert_eq!(request.instance_id, id);
        assert_eq!(request.agent, "seo-optimizer");
        assert_eq!(request.action, "optimize");
        assert_eq!(request.params["headline"], json!("About tokio"));
        assert_eq!(request.params["limit"], json!(10));
        assert_eq!(request.params["topic"], json!("tokio"));

        // non-object results are recorded but not merged
        let instance = engine.get_instance_status(&id).await.unwrap();
        assert_eq!(instance.history[0].result, json!("plain result"));
        assert_eq!(instance.data.len(), 1);
    }

    #[tokio::test]
    async fn test_transform_and_delay_steps() {
        let engine = engine();
        let wf = WorkflowDefinition::new("local", "Local only")
            .with_step(WorkflowStep::delay("pause", 5))
            .with_step(WorkflowStep::transform(
                "shape",
                vec![
                    TransformOp::Format { key: "slug".into(), template: "${title}-draft".into() },
                    TransformOp::Remove { key: "delayed".into() },
                ],
            ));
        engine.register_workflow("local", wf).await.unwrap();

        let id = engine
            .start_workflow("local", data(json!({ "title": "hello" })), StartOptions::default())
            .await
            .unwrap();
        let instance = engine.get_instance_status(&id).await.unwrap();
        assert_eq!(instance.history[0].result, json!({ "delayed": 5 }));
        assert_eq!(instance.data, data(json!({ "title": "hello", "slug": "hello-draft" })));
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_result() {
        let engine = engine();
        serve_delayed(engine.bus());

        let wf = WorkflowDefinition::new("long", "Long")
            .with_step(WorkflowStep::agent("slow", "x", "y").with_params(json!({ "delayMs": 80 })))
            .with_step(WorkflowStep::agent("never", "x", "y"));
        engine.register_workflow("long", wf).await.unwrap();

        let (id, handle) = engine
            .spawn_workflow("long", DataMap::new(), StartOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.get_running_instances().await.len(), 1);
        assert!(engine.stop_workflow(&id).await.unwrap());
        assert!(!engine.stop_workflow(&id).await.unwrap());

        let returned = handle.await.unwrap().unwrap();
        assert_eq!(returned, id);
        let instance = engine.get_instance_status(&id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.history.is_empty());
        assert_eq!(instance.current_step_index, 0);
        assert!(engine.get_running_instances().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_definition_and_instance() {
        let engine = engine();
        let err = engine
            .start_workflow("missing", DataMap::new(), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DefinitionNotFound(id) if id == "missing"));
        assert!(matches!(
            engine.stop_workflow("nope").await,
            Err(WorkflowError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_overwrites_and_validates() {
        let engine = engine();
        engine
            .register_workflow("wf", WorkflowDefinition::new("ignored", "v1").with_step(WorkflowStep::delay("a", 0)))
            .await
            .unwrap();
        engine
            .register_workflow("wf", WorkflowDefinition::new("wf", "v2").with_step(WorkflowStep::delay("a", 0)))
            .await
            .unwrap();
        let stored = engine.get_workflow("wf").await.unwrap();
        assert_eq!(stored.name, "v2");
        assert_eq!(engine.get_workflows().await.len(), 1);

        let invalid = WorkflowDefinition::new("bad", "bad");
        assert!(matches!(
            engine.register_workflow("bad", invalid).await,
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_metrics_and_eviction() {
        let engine = engine();
        serve(engine.bus(), |req| {
            if req.agent == "bad" {
                Err(AgentError::ActionFailed("no".into()))
            } else {
                Ok(json!({}))
            }
        });
        engine
            .register_workflow("ok", WorkflowDefinition::new("ok", "ok").with_step(WorkflowStep::agent("a", "good", "x")))
            .await
            .unwrap();
        engine
            .register_workflow(
                "bad",
                WorkflowDefinition::new("bad", "bad")
                    .with_retry_policy(RetryPolicy::none())
                    .with_step(WorkflowStep::agent("a", "bad", "x")),
            )
            .await
            .unwrap();

        engine.start_workflow("ok", DataMap::new(), StartOptions::default()).await.unwrap();
        engine.start_workflow("ok", DataMap::new(), StartOptions::default()).await.unwrap();
        assert!(engine.start_workflow("bad", DataMap::new(), StartOptions::default()).await.is_err());

        let metrics = engine.get_metrics().await;
        assert_eq!(metrics.registered_workflows, 2);
        assert_eq!(metrics.total_instances, 3);
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.running, 0);

        assert_eq!(engine.evict_finished(Utc::now() - chrono::Duration::hours(1)).await, 0);
        assert_eq!(engine.evict_finished(Utc::now() + chrono::Duration::seconds(1)).await, 3);
        assert_eq!(engine.get_metrics().await.total_instances, 0);
    }
}
