//! Finite-state machines for workflow and step lifecycles.
//!
//! `machine` holds the generic `StateMachine<S, C>`; `workflow` and `step`
//! are pre-configured instantiations over `WorkflowStatus` and `StepStatus`.
//! The transition tables below are the single source for both the live
//! machines and the static lookup helpers.

pub mod machine;
pub mod step;
pub mod workflow;

pub use machine::{
    HistoryConfig, MachineEvent, MachineSnapshot, MachineState, StateConfig, StateMachine,
    StateMachineConfig, TransitionConfig, TransitionRecord,
};
pub use step::{StepMachineContext, StepStateMachine};
pub use workflow::{WorkflowMachineContext, WorkflowStateMachine};

use taskflow_types::workflow::{StepStatus, WorkflowStatus};
use thiserror::Error;

/// Errors raised by state machine construction and transitions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateMachineError {
    #[error("invalid state machine config '{machine}': {message}")]
    InvalidConfig { machine: String, message: String },

    #[error("transition from {from} to {to} failed: {message}")]
    HookFailed {
        from: String,
        to: String,
        message: String,
    },

    #[error("snapshot belongs to machine '{actual}', expected '{expected}'")]
    SnapshotMismatch { expected: String, actual: String },
}

// ---------------------------------------------------------------------------
// Transition tables
// ---------------------------------------------------------------------------

const WORKFLOW_TRANSITIONS: &[(WorkflowStatus, &[WorkflowStatus])] = &[
    (
        WorkflowStatus::Pending,
        &[WorkflowStatus::Running, WorkflowStatus::Cancelled],
    ),
    (
        WorkflowStatus::Running,
        &[
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::Timeout,
        ],
    ),
    (WorkflowStatus::Paused, &[WorkflowStatus::Running]),
];

/// `Running -> Running` is the guarded retry self-loop.
const STEP_TRANSITIONS: &[(StepStatus, &[StepStatus])] = &[
    (
        StepStatus::Pending,
        &[
            StepStatus::Waiting,
            StepStatus::Running,
            StepStatus::Skipped,
            StepStatus::Cancelled,
        ],
    ),
    (StepStatus::Waiting, &[StepStatus::Running]),
    (
        StepStatus::Running,
        &[
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Cancelled,
            StepStatus::Timeout,
            StepStatus::Running,
        ],
    ),
];

fn lookup<S: PartialEq + 'static>(table: &'static [(S, &'static [S])], state: &S) -> &'static [S] {
    table
        .iter()
        .find(|(from, _)| from == state)
        .map(|(_, to)| *to)
        .unwrap_or(&[])
}

pub fn valid_workflow_transitions(status: WorkflowStatus) -> &'static [WorkflowStatus] {
    lookup(WORKFLOW_TRANSITIONS, &status)
}

pub fn valid_step_transitions(status: StepStatus) -> &'static [StepStatus] {
    lookup(STEP_TRANSITIONS, &status)
}

pub fn is_workflow_status_final(status: WorkflowStatus) -> bool {
    valid_workflow_transitions(status).is_empty()
}

pub fn is_step_status_final(status: StepStatus) -> bool {
    valid_step_transitions(status).is_empty()
}
