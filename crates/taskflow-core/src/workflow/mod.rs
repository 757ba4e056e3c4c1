//! Workflow execution engine: definitions, dependency planning, and step execution.
//!
//! - `definition` -- YAML/JSON parsing and structural validation
//! - `dag` -- dependency graph, cycle detection, execution waves
//! - `context` -- variable scope and `${path}` template resolution
//! - `expression` -- condition evaluation
//! - `retry` -- retry policy arithmetic
//! - `dispatch` -- agent dispatch port supplied by the host
//! - `step_runner` -- per-step-type execution
//! - `engine` -- admission, instance lifecycle, pause/resume/cancel, stats
//! - `builder` -- fluent definition construction

pub mod builder;
pub mod context;
pub mod dag;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod expression;
mod instance;
pub mod retry;
pub mod step_runner;

pub use builder::WorkflowBuilder;
pub use dispatch::{AgentDispatcher, AgentOutcome, AgentTask, BoxAgentDispatcher, DispatchError};
pub use engine::{EngineError, EngineStats, WorkflowEngine};
pub use step_runner::StepError;
