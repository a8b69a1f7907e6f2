//! Workflow engine: step-by-step agent orchestration over the event bus.
//!
//! # Architecture
//!
//! ```text
//! WorkflowDefinition ──► WorkflowEngine ──► WorkflowInstance
//!   (schema, conditions,       │              (data, history, errors)
//!    transform scripts)        │
//!                     agent.request / agent.response.<id>
//!                              │
//!                           EventBus ──► AgentInvoker
//! ```

pub mod condition;
pub mod context;
pub mod engine;
pub mod instance;
pub mod schema;
pub mod transform;

pub use condition::{CompareOp, Condition};
pub use context::DataMap;
pub use engine::{EngineMetrics, WorkflowEngine};
pub use instance::{InstanceStatus, Priority, StartOptions, WorkflowInstance};
pub use schema::{OnError, RetryPolicy, StepKind, WorkflowDefinition, WorkflowStep};
pub use transform::TransformOp;
