//! Execution core for Taskflow.
//!
//! Contains the generic state machine, the workflow execution engine, and
//! the rollback manager. Collaborators are ports (`AgentDispatcher`,
//! `CheckpointStorage`) implemented by the host or by `taskflow-infra`;
//! this crate performs no filesystem or network I/O itself.

pub mod event;
pub mod rollback;
pub mod state_machine;
pub mod workflow;
