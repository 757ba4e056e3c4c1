//! Infrastructure layer for Taskflow.
//!
//! Implements the storage port defined in `taskflow-core` on the local
//! filesystem and loads the TOML configuration file.

pub mod checkpoint_store;
pub mod config;
