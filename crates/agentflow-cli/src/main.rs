//! AgentFlow CLI: run and inspect agent workflows from the command line.
//!
//! Drives the same `WorkflowSystem` that applications embed, with simulated
//! agents standing in for real workers.

use agentflow_cli::commands::{self, AgentOptions};
use clap::{Parser, Subcommand};

/// AgentFlow CLI - Event-driven agent workflow orchestration
#[derive(Parser)]
#[command(name = "agentflow", version, about = "AgentFlow CLI — Event-driven agent workflow orchestration")]
pub struct Cli {
    /// Artificial latency of every simulated agent call, in milliseconds
    #[arg(long, env = "AGENTFLOW_AGENT_LATENCY_MS", default_value_t = 0, global = true)]
    agent_latency_ms: u64,

    /// Make every action of this agent fail (repeatable)
    #[arg(long = "fail-agent", global = true)]
    fail_agents: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run, validate and list workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Print the health report of an initialized system
    Health,

    /// Run a workflow and print event bus statistics
    Stats {
        /// Built-in workflow id
        #[arg(default_value = "content-creation")]
        workflow_id: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Run a built-in workflow, or one loaded from a YAML file
    Run {
        /// Built-in workflow id (e.g. "content-creation")
        workflow_id: Option<String>,
        /// Path to a workflow YAML file
        #[arg(long, short = 'f', conflicts_with = "workflow_id")]
        file: Option<String>,
        /// Initial data as a JSON object
        #[arg(long)]
        payload: Option<String>,
        /// Recorded as the instance's initiator
        #[arg(long, default_value = "cli")]
        initiator: String,
    },
    /// Validate a workflow YAML file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
    /// List the built-in workflows
    List {
        /// Print full definitions as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentflow_core=warn,agentflow_cli=info,agentflow=info".into()),
        )
        .init();

    let options = AgentOptions {
        latency_ms: cli.agent_latency_ms,
        failing: cli.fail_agents,
    };

    let result = match cli.command {
        Some(Commands::Workflow { action }) => match action {
            WorkflowAction::Run {
                workflow_id,
                file,
                payload,
                initiator,
            } => {
                commands::workflow::run(
                    workflow_id.as_deref(),
                    file.as_deref(),
                    payload.as_deref(),
                    &initiator,
                    &options,
                )
                .await
            }
            WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
            WorkflowAction::List { json } => commands::workflow::list(json).await,
        },
        Some(Commands::Health) => commands::system::health(&options).await,
        Some(Commands::Stats { workflow_id }) => commands::system::stats(&workflow_id, &options).await,
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
