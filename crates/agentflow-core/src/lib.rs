//! AgentFlow Core: in-process workflow orchestration for agent pipelines.
//!
//! This crate contains the event bus, the workflow engine and the
//! composition root that wires them to an agent registry. It owns no network
//! protocol or storage, making it suitable for use in:
//!
//! - CLI tools (via `agentflow-cli`)
//! - HTTP or RPC servers that embed a `WorkflowSystem`
//! - Tests that drive workflows against in-memory agents

pub mod agents;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestration;
pub mod workflow;

// Convenience re-exports
pub use agents::{Agent, AgentInvoker, AgentRegistry, FnAgent};
pub use config::SystemConfig;
pub use error::{AgentError, BusError, WorkflowError};
pub use events::EventBus;
pub use orchestration::WorkflowSystem;
pub use workflow::{WorkflowDefinition, WorkflowEngine, WorkflowStep};
