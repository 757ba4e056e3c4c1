//! Workflow lifecycle state machine.
//!
//! Entering `Running` stamps `started_at` the first time only; entering any
//! terminal state stamps `completed_at`.

use chrono::{DateTime, Utc};
use taskflow_types::workflow::WorkflowStatus;
use uuid::Uuid;

use super::machine::{
    HistoryConfig, MachineEvent, StateConfig, StateMachine, StateMachineConfig, TransitionConfig,
};
use super::{StateMachineError, is_workflow_status_final, valid_workflow_transitions};
use crate::event::SubscriptionId;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowMachineContext {
    pub workflow_id: String,
    pub instance_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct WorkflowStateMachine {
    machine: StateMachine<WorkflowStatus, WorkflowMachineContext>,
}

impl WorkflowStateMachine {
    pub fn new(workflow_id: impl Into<String>, instance_id: Uuid) -> Result<Self, StateMachineError> {
        let states = WorkflowStatus::ALL
            .into_iter()
            .map(|status| {
                let config = StateConfig::new(status);
                if status == WorkflowStatus::Running {
                    config.on_enter(|ctx: &mut WorkflowMachineContext| {
                        if ctx.started_at.is_none() {
                            ctx.started_at = Some(Utc::now());
                        }
                        Ok(())
                    })
                } else if is_workflow_status_final(status) {
                    config.on_enter(|ctx: &mut WorkflowMachineContext| {
                        ctx.completed_at = Some(Utc::now());
                        Ok(())
                    })
                } else {
                    config
                }
            })
            .collect();

        let transitions = WorkflowStatus::ALL
            .into_iter()
            .flat_map(|from| {
                valid_workflow_transitions(from)
                    .iter()
                    .map(move |to| TransitionConfig::new([from], *to))
            })
            .collect();

        let machine = StateMachine::new(StateMachineConfig {
            id: format!("workflow:{instance_id}"),
            initial: WorkflowStatus::Pending,
            states,
            transitions,
            context: WorkflowMachineContext {
                workflow_id: workflow_id.into(),
                instance_id,
                started_at: None,
                completed_at: None,
                error: None,
            },
            history: HistoryConfig::default(),
        })?;
        Ok(Self { machine })
    }

    /// Invoke `callback(previous, next)` after every successful transition.
    pub fn on_state_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(WorkflowStatus, WorkflowStatus) + Send + Sync + 'static,
    {
        self.machine.subscribe(move |event| {
            if let MachineEvent::TransitionCompleted { from, to, .. } = event {
                callback(*from, *to);
            }
        })
    }

    pub fn status(&self) -> WorkflowStatus {
        self.machine.current_state()
    }

    pub fn is_final(&self) -> bool {
        self.machine.is_final_state()
    }

    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        self.machine.can_transition_to(target)
    }

    pub fn transition(
        &self,
        target: WorkflowStatus,
        trigger: Option<&str>,
    ) -> Result<bool, StateMachineError> {
        self.machine.transition(target, trigger)
    }

    /// Transition to `Failed`, recording `error` in the context.
    pub fn fail(&self, error: impl Into<String>) -> Result<bool, StateMachineError> {
        let error = error.into();
        let trigger = error.clone();
        self.machine
            .transition_with(WorkflowStatus::Failed, Some(trigger.as_str()), |_, ctx| {
                ctx.error = Some(error);
                true
            })
    }

    pub fn context(&self) -> WorkflowMachineContext {
        self.machine.context()
    }

    pub fn machine(&self) -> &StateMachine<WorkflowStatus, WorkflowMachineContext> {
        &self.machine
    }
}
