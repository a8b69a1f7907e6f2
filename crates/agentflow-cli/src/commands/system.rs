//! `agentflow health` / `agentflow stats`: Inspect a freshly initialized system.

use super::{init_system, print_json, AgentOptions};

/// Print the aggregated health report.
pub async fn health(options: &AgentOptions) -> Result<(), String> {
    let system = init_system(options).await?;
    let health = system.health_check().await;
    print_json(&serde_json::to_value(&health).map_err(|e| e.to_string())?);
    system.shutdown().await;
    Ok(())
}

/// Run one built-in workflow and print the resulting bus statistics.
pub async fn stats(workflow_id: &str, options: &AgentOptions) -> Result<(), String> {
    let system = init_system(options).await?;
    if let Err(e) = system
        .start_workflow(workflow_id, Default::default(), Default::default())
        .await
    {
        tracing::warn!("[Stats] Workflow '{}' did not complete: {}", workflow_id, e);
    }
    print_json(&serde_json::to_value(system.get_event_stats()).map_err(|e| e.to_string())?);
    system.shutdown().await;
    Ok(())
}
