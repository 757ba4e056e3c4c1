//! Shared domain types for Taskflow.
//!
//! Workflow definitions, lifecycle statuses, instance snapshots, checkpoint
//! and rollback types, events, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod rollback;
pub mod workflow;
