//! Event types published by the Taskflow engine and rollback manager.
//!
//! Both enums are `Clone + Send + Sync` and serde-tagged so subscribers can
//! forward them to logs or external sinks unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rollback::{CheckpointType, CompensationResult, RollbackStatus, RollbackStrategy};
use crate::workflow::StepType;

/// Lifecycle events emitted by the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStarted {
        instance_id: Uuid,
        workflow_id: String,
        workflow_name: String,
    },

    WorkflowCompleted {
        instance_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        steps_completed: u32,
    },

    WorkflowFailed {
        instance_id: Uuid,
        workflow_id: String,
        error: String,
    },

    WorkflowPaused { instance_id: Uuid },

    WorkflowResumed { instance_id: Uuid },

    WorkflowCancelled { instance_id: Uuid },

    /// The whole-instance timeout elapsed.
    WorkflowTimedOut { instance_id: Uuid, timeout_ms: u64 },

    StepStarted {
        instance_id: Uuid,
        step_id: String,
        step_type: StepType,
        /// 1-based attempt number.
        attempt: u32,
    },

    StepCompleted {
        instance_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    StepFailed {
        instance_id: Uuid,
        step_id: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    StepSkipped {
        instance_id: Uuid,
        step_id: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::WorkflowStarted { instance_id, .. }
            | EngineEvent::WorkflowCompleted { instance_id, .. }
            | EngineEvent::WorkflowFailed { instance_id, .. }
            | EngineEvent::WorkflowPaused { instance_id }
            | EngineEvent::WorkflowResumed { instance_id }
            | EngineEvent::WorkflowCancelled { instance_id }
            | EngineEvent::WorkflowTimedOut { instance_id, .. }
            | EngineEvent::StepStarted { instance_id, .. }
            | EngineEvent::StepCompleted { instance_id, .. }
            | EngineEvent::StepFailed { instance_id, .. }
            | EngineEvent::StepSkipped { instance_id, .. } => *instance_id,
        }
    }

    /// Step ID for step-scoped events, `None` for workflow-scoped ones.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            EngineEvent::StepStarted { step_id, .. }
            | EngineEvent::StepCompleted { step_id, .. }
            | EngineEvent::StepFailed { step_id, .. }
            | EngineEvent::StepSkipped { step_id, .. } => Some(step_id),

            EngineEvent::WorkflowStarted { .. }
            | EngineEvent::WorkflowCompleted { .. }
            | EngineEvent::WorkflowFailed { .. }
            | EngineEvent::WorkflowPaused { .. }
            | EngineEvent::WorkflowResumed { .. }
            | EngineEvent::WorkflowCancelled { .. }
            | EngineEvent::WorkflowTimedOut { .. } => None,
        }
    }
}

/// Events emitted by a rollback manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackEvent {
    CheckpointCreated {
        checkpoint_id: Uuid,
        instance_id: Uuid,
        checkpoint_type: CheckpointType,
    },

    CheckpointDeleted {
        checkpoint_id: Uuid,
        instance_id: Uuid,
    },

    RollbackStarted {
        rollback_id: Uuid,
        instance_id: Uuid,
        strategy: RollbackStrategy,
        status: RollbackStatus,
    },

    CompensationStarted {
        rollback_id: Uuid,
        step_id: String,
        action_name: String,
    },

    CompensationCompleted {
        rollback_id: Uuid,
        result: CompensationResult,
    },

    RollbackCompleted {
        rollback_id: Uuid,
        instance_id: Uuid,
        status: RollbackStatus,
        rolled_back_step_ids: Vec<String>,
    },

    RollbackFailed {
        rollback_id: Uuid,
        instance_id: Uuid,
        error: String,
    },
}
