//! `agentflow workflow`: Run, validate and list workflows.

use agentflow_core::orchestration::catalogue;
use agentflow_core::workflow::{StartOptions, StepKind, WorkflowDefinition, WorkflowStep};
use agentflow_core::WorkflowError;

use super::{init_system, parse_payload, print_json, AgentOptions};

/// Run a built-in workflow by id, or a workflow loaded from a YAML file.
pub async fn run(
    workflow_id: Option<&str>,
    workflow_file: Option<&str>,
    payload: Option<&str>,
    initiator: &str,
    options: &AgentOptions,
) -> Result<(), String> {
    let data = parse_payload(payload)?;
    let system = init_system(options).await?;

    let workflow_id = match (workflow_id, workflow_file) {
        (_, Some(file)) => {
            let definition = WorkflowDefinition::from_file(file)?;
            let id = definition.id.clone();
            println!("📄 Loaded workflow: {} ({})", definition.name, file);
            system
                .register_workflow(definition)
                .await
                .map_err(|e| e.to_string())?;
            id
        }
        (Some(id), None) => id.to_string(),
        (None, None) => return Err("Specify a workflow id or --file".to_string()),
    };

    let outcome = system
        .start_workflow(&workflow_id, data, StartOptions::initiated_by(initiator))
        .await;

    let instance_id = match &outcome {
        Ok(id) => Some(id.as_str()),
        Err(e) => e.instance_id(),
    };
    if let Some(id) = instance_id {
        let instance = system.get_workflow_status(id).await.map_err(|e| e.to_string())?;
        print_json(&serde_json::to_value(&instance).map_err(|e| e.to_string())?);
    }

    system.shutdown().await;
    match outcome {
        Ok(_) => {
            println!("\n🎉 Workflow '{}' completed successfully!", workflow_id);
            Ok(())
        }
        Err(WorkflowError::StepFailed { step_name, source, .. }) => Err(format!(
            "Workflow '{}' failed at step '{}': {}",
            workflow_id, step_name, source
        )),
        Err(e) => Err(e.to_string()),
    }
}

/// Validate a workflow YAML file without executing it.
pub async fn validate(workflow_file: &str) -> Result<(), String> {
    let mut workflow = WorkflowDefinition::from_file(workflow_file)?;
    workflow.validate().map_err(|e| e.to_string())?;
    let problems = workflow.compile_conditions();
    if !problems.is_empty() {
        return Err(format!("Malformed conditions:\n  {}", problems.join("\n  ")));
    }

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Id: {}", workflow.id);
    println!("   Steps: {}", workflow.steps.len());
    print_steps(&workflow.steps, "   ");
    for setting in workflow.ignored_branch_settings() {
        println!("⚠️  Ignored inside a parallel step: {}", setting);
    }
    Ok(())
}

/// List the built-in workflow catalogue.
pub async fn list(as_json: bool) -> Result<(), String> {
    let workflows = catalogue::builtin_workflows();
    if as_json {
        print_json(&serde_json::to_value(&workflows).map_err(|e| e.to_string())?);
        return Ok(());
    }

    println!("┌──────────────────────────┬──────────────────────────┬───────┐");
    println!("│ ID                       │ Name                     │ Steps │");
    println!("├──────────────────────────┼──────────────────────────┼───────┤");
    for workflow in &workflows {
        println!(
            "│ {:<24} │ {:<24} │ {:>5} │",
            truncate(&workflow.id, 24),
            truncate(&workflow.name, 24),
            workflow.steps.len()
        );
    }
    println!("└──────────────────────────┴──────────────────────────┴───────┘");
    Ok(())
}

fn print_steps(steps: &[WorkflowStep], indent: &str) {
    for (i, step) in steps.iter().enumerate() {
        let detail = match &step.kind {
            StepKind::Agent { agent_name, action, .. } => format!("{}.{}", agent_name, action),
            StepKind::Condition { on_true, on_false, .. } => format!(
                "true → {}, false → {}",
                on_true.as_deref().unwrap_or("next"),
                on_false.as_deref().unwrap_or("next")
            ),
            StepKind::Parallel { steps } => format!("{} branch(es)", steps.len()),
            StepKind::Delay { delay_ms } => format!("{}ms", delay_ms),
            StepKind::Transform { script } => format!("{} op(s)", script.len()),
        };
        let guard = if step.guard.is_some() { " [guarded]" } else { "" };
        println!(
            "{}{}. {} ({}: {}){}",
            indent,
            i + 1,
            step.name,
            step.kind.as_str(),
            detail,
            guard
        );
        if let StepKind::Parallel { steps } = &step.kind {
            print_steps(steps, &format!("{}   ", indent));
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
