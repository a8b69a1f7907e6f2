//! Integration tests for the workflow system.
//!
//! These tests drive the built-in catalogue and YAML-defined workflows end to
//! end through `WorkflowSystem`, with in-memory agents standing in for the
//! real ones.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use agentflow_core::agents::{AgentRegistry, FnAgent};
use agentflow_core::events::EventFilter;
use agentflow_core::workflow::engine::{WORKFLOW_COMPLETED, WORKFLOW_STEP_SKIPPED};
use agentflow_core::workflow::{DataMap, InstanceStatus, StartOptions, WorkflowDefinition};
use agentflow_core::{AgentError, WorkflowError, WorkflowSystem};
use serde_json::{json, Value};

fn echo(name: &str, result: Value) -> FnAgent {
    FnAgent::new(name, move |action, _| {
        let mut result = result.clone();
        async move {
            if let Value::Object(map) = &mut result {
                map.insert("lastAction".to_string(), json!(action));
            }
            Ok(result)
        }
    })
}

/// Agents for the built-in catalogue. `quality` and `valid` steer the branches.
fn content_agents(quality: f64, valid: bool) -> Arc<AgentRegistry> {
    Arc::new(
        AgentRegistry::new()
            .with_agent(echo("content-analyzer", json!({ "audience": "developers" })))
            .with_agent(echo("content-generator", json!({ "draft": "Hello, Rust" })))
            .with_agent(echo("quality-checker", json!({ "qualityScore": quality })))
            .with_agent(echo("seo-optimizer", json!({ "keywords": ["rust", "async"] })))
            .with_agent(echo("content-validator", json!({ "isValid": valid })))
            .with_agent(echo("content-formatter", json!({ "formatted": true })))
            .with_agent(echo("publisher", json!({ "published": true })))
            .with_agent(echo("notification-agent", json!({ "notified": true }))),
    )
}

async fn system(agents: Arc<AgentRegistry>) -> WorkflowSystem {
    let system = WorkflowSystem::new(agents);
    system.init().await.expect("Failed to initialize workflow system");
    system
}

fn data(value: Value) -> DataMap {
    value.as_object().cloned().unwrap_or_default()
}

fn executed(instance: &agentflow_core::workflow::WorkflowInstance) -> Vec<String> {
    instance.history.iter().map(|h| h.step_name.clone()).collect()
}

#[tokio::test]
async fn test_content_creation_skips_revision_for_good_drafts() {
    let system = system(content_agents(0.9, true)).await;

    let id = system
        .start_content_creation_workflow(data(json!({ "topic": "ownership" })), "editor-1")
        .await
        .unwrap();
    let instance = system.get_workflow_status(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context.initiator, "editor-1");
    assert_eq!(
        executed(&instance),
        vec![
            "analyze-requirements",
            "generate-content",
            "quality-check",
            "quality-gate",
            "seo-optimize"
        ]
    );
    assert_eq!(instance.data["keywords"], json!(["rust", "async"]));
    assert_eq!(instance.data["topic"], json!("ownership"));
}

#[tokio::test]
async fn test_content_creation_revises_weak_drafts() {
    let system = system(content_agents(0.4, true)).await;

    let id = system
        .start_content_creation_workflow(data(json!({ "topic": "lifetimes" })), "editor-2")
        .await
        .unwrap();
    let instance = system.get_workflow_status(&id).await.unwrap();

    assert!(executed(&instance).contains(&"revise-content".to_string()));
    assert_eq!(instance.data["lastAction"], json!("optimize"));
}

#[tokio::test]
async fn test_publishing_guards_skip_invalid_content() {
    let system = system(content_agents(0.9, false)).await;

    let id = system
        .start_publishing_workflow("post-42", &["blog".to_string(), "newsletter".to_string()])
        .await
        .unwrap();
    let instance = system.get_workflow_status(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(executed(&instance), vec!["validate-content"]);
    assert!(!instance.data.contains_key("published"));
    assert_eq!(instance.data["platforms"], json!(["blog", "newsletter"]));

    let skipped = system
        .bus()
        .get_event_history(&EventFilter::by_name(WORKFLOW_STEP_SKIPPED));
    assert_eq!(skipped.len(), 3);
}

#[tokio::test]
async fn test_publishing_valid_content() {
    let system = system(content_agents(0.9, true)).await;

    let id = system
        .start_publishing_workflow("post-7", &["blog".to_string()])
        .await
        .unwrap();
    let instance = system.get_workflow_status(&id).await.unwrap();
    assert_eq!(instance.data["published"], json!(true));
    assert_eq!(instance.data["notified"], json!(true));
    assert_eq!(
        system
            .bus()
            .get_event_history(&EventFilter::by_name(WORKFLOW_COMPLETED))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_yaml_workflow_from_file() {
    let yaml = r#"
id: onboarding
name: "User Onboarding"
retryPolicy: { maxRetries: 0, delayMs: 0 }
conditions:
  isPremium: { expr: "plan == 'premium'" }
steps:
  - name: welcome
    type: agent
    agentName: mailer
    action: send_welcome
    parameters:
      subject: "Welcome, ${name}"
  - name: premium-perks
    type: agent
    agentName: mailer
    action: send_perks
    when: { ref: isPremium }
  - name: tidy
    type: transform
    script:
      - op: rename
        from: subject
        to: lastSubject
"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let definition = WorkflowDefinition::from_file(file.path().to_str().unwrap()).unwrap();
    let agents = Arc::new(AgentRegistry::new().with_agent(FnAgent::new("mailer", |action, params| async move {
        Ok(json!({ "sent": action, "subject": params.get("subject").cloned() }))
    })));
    let system = system(agents).await;
    system.register_workflow(definition).await.unwrap();
    assert_eq!(system.list_workflows().await.len(), 6);

    let id = system
        .start_workflow(
            "onboarding",
            data(json!({ "name": "Ada", "plan": "premium" })),
            StartOptions::default(),
        )
        .await
        .unwrap();
    let instance = system.get_workflow_status(&id).await.unwrap();

    assert_eq!(executed(&instance), vec!["welcome", "premium-perks", "tidy"]);
    assert_eq!(instance.data["sent"], json!("send_perks"));
    assert_eq!(instance.data["lastSubject"], json!("Welcome, Ada"));
    assert!(!instance.data.contains_key("subject"));
}

#[tokio::test]
async fn test_concurrent_instances_are_independent() {
    let agents = Arc::new(AgentRegistry::new().with_agent(FnAgent::new("sleeper", |_, params| async move {
        let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept": ms }))
    })));
    let system = system(agents).await;
    system
        .register_workflow(
            WorkflowDefinition::new("nap", "Nap")
                .with_step(agentflow_core::WorkflowStep::agent("sleep", "sleeper", "sleep")),
        )
        .await
        .unwrap();

    let engine = system.engine();
    let (slow_id, slow) = engine
        .spawn_workflow("nap", data(json!({ "ms": 60 })), StartOptions::default())
        .await
        .unwrap();
    let (fast_id, fast) = engine
        .spawn_workflow("nap", data(json!({ "ms": 5 })), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(fast.await.unwrap().unwrap(), fast_id);
    assert_eq!(
        system.get_workflow_status(&slow_id).await.unwrap().status,
        InstanceStatus::Running
    );
    assert_eq!(slow.await.unwrap().unwrap(), slow_id);

    let fast_instance = system.get_workflow_status(&fast_id).await.unwrap();
    let slow_instance = system.get_workflow_status(&slow_id).await.unwrap();
    assert_eq!(fast_instance.data["slept"], json!(5));
    assert_eq!(slow_instance.data["slept"], json!(60));
}

#[tokio::test]
async fn test_stop_ignores_late_agent_result() {
    let agents = Arc::new(AgentRegistry::new().with_agent(FnAgent::new("slow", |_, _| async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(json!({ "late": true }))
    })));
    let system = system(agents).await;
    system
        .register_workflow(
            WorkflowDefinition::new("slow", "Slow")
                .with_step(agentflow_core::WorkflowStep::agent("wait", "slow", "work")),
        )
        .await
        .unwrap();

    let (id, handle) = system
        .engine()
        .spawn_workflow("slow", DataMap::new(), StartOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(system.stop_workflow(&id).await.unwrap());
    handle.await.unwrap().unwrap();

    let instance = system.get_workflow_status(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert!(!instance.data.contains_key("late"));
    assert!(instance.history.is_empty());
}

#[tokio::test]
async fn test_failure_keeps_partial_history() {
    let agents = Arc::new(
        AgentRegistry::new()
            .with_agent(echo("content-analyzer", json!({ "audience": "ops" })))
            .with_agent(FnAgent::new("content-generator", |_, _| async move {
                Err::<Value, _>(AgentError::ActionFailed("model overloaded".to_string()))
            })),
    );
    let mut config = agentflow_core::SystemConfig::default();
    config.engine.default_retry = agentflow_core::workflow::RetryPolicy::new(1, 0);
    let system = WorkflowSystem::with_config(agents, config);
    system.init().await.unwrap();

    let err = system
        .start_content_creation_workflow(DataMap::new(), "editor-3")
        .await
        .unwrap_err();
    let WorkflowError::StepFailed { instance_id, step_name, .. } = &err else {
        panic!("expected StepFailed, got {err:?}");
    };
    assert_eq!(step_name, "generate-content");

    let instance = system.get_workflow_status(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(executed(&instance), vec!["analyze-requirements"]);
    assert_eq!(instance.errors.len(), 2);
    assert!(instance.context.end_time.is_some());

    let health = system.health_check().await;
    assert_eq!(health.engine.details["failed"], json!(1));
}
