//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! agentflow-core `WorkflowSystem` against simulated agents.

pub mod simulated;
pub mod system;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::workflow::DataMap;
use agentflow_core::{SystemConfig, WorkflowSystem};

use simulated::SimulatedAgents;

/// Options shared by every command that runs workflows.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Artificial latency of every simulated agent call
    pub latency_ms: u64,
    /// Agents whose actions always fail
    pub failing: Vec<String>,
}

/// Build and initialize a `WorkflowSystem` backed by simulated agents.
///
/// Configuration comes from the `AGENTFLOW_*` environment variables.
pub async fn init_system(options: &AgentOptions) -> Result<WorkflowSystem, String> {
    let agents = options.failing.iter().fold(
        SimulatedAgents::new(Duration::from_millis(options.latency_ms)),
        |agents, name| agents.failing(name.clone()),
    );
    let system = WorkflowSystem::with_config(Arc::new(agents), SystemConfig::from_env());
    system
        .init()
        .await
        .map_err(|e| format!("Failed to initialize workflow system: {}", e))?;
    Ok(system)
}

/// Parse a JSON object given on the command line.
pub fn parse_payload(payload: Option<&str>) -> Result<DataMap, String> {
    match payload {
        None => Ok(DataMap::new()),
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err("Payload must be a JSON object".to_string()),
            Err(e) => Err(format!("Invalid payload JSON: {}", e)),
        },
    }
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
