//! Checkpointing and rollback for workflow instances.
//!
//! - `checkpoint` -- bounded in-memory checkpoint list
//! - `compensation` -- undo actions registered per step
//! - `storage` -- optional persistent checkpoint mirror
//! - `manager` -- the per-instance `RollbackManager`

pub mod checkpoint;
pub mod compensation;
pub mod manager;
pub mod storage;

pub use checkpoint::CheckpointLog;
pub use compensation::{CompensationAction, CompensationContext, CompensationRetry};
pub use manager::{ManagerSnapshot, RollbackManager};
pub use storage::{BoxCheckpointStorage, CheckpointStorage, InMemoryCheckpointStorage};

use taskflow_types::error::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the rollback manager.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("rollback manager is bound to instance {expected}, got {actual}")]
    InstanceMismatch { expected: Uuid, actual: Uuid },

    #[error("a rollback is already in progress")]
    AlreadyInProgress,

    #[error("target checkpoint ID is required")]
    TargetCheckpointRequired,

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("no workflow start checkpoint found")]
    NoWorkflowStartCheckpoint,

    #[error("no step success checkpoint found")]
    NoStepSuccessCheckpoint,

    #[error("required compensation for step {step_id} failed")]
    RequiredCompensationFailed { step_id: String },

    #[error("invalid compensation action: {0}")]
    InvalidCompensation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
