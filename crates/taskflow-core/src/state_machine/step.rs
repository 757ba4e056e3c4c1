//! Step lifecycle state machine.
//!
//! `Running -> Running` is the retry self-loop: permitted while
//! `retry_count < max_retries`, and each taken retry increments the count.

use chrono::{DateTime, Utc};
use taskflow_types::workflow::StepStatus;

use super::machine::{HistoryConfig, StateConfig, StateMachine, StateMachineConfig, TransitionConfig};
use super::{StateMachineError, is_step_status_final, valid_step_transitions};

#[derive(Debug, Clone, PartialEq)]
pub struct StepMachineContext {
    pub step_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct StepStateMachine {
    machine: StateMachine<StepStatus, StepMachineContext>,
}

impl StepStateMachine {
    pub fn new(step_id: impl Into<String>, max_retries: u32) -> Result<Self, StateMachineError> {
        let step_id = step_id.into();
        let states = StepStatus::ALL
            .into_iter()
            .map(|status| {
                let config = StateConfig::new(status);
                if status == StepStatus::Running {
                    config.on_enter(|ctx: &mut StepMachineContext| {
                        if ctx.started_at.is_none() {
                            ctx.started_at = Some(Utc::now());
                        }
                        Ok(())
                    })
                } else if is_step_status_final(status) {
                    config.on_enter(|ctx: &mut StepMachineContext| {
                        ctx.completed_at = Some(Utc::now());
                        Ok(())
                    })
                } else {
                    config
                }
            })
            .collect();

        let transitions = StepStatus::ALL
            .into_iter()
            .flat_map(|from| {
                valid_step_transitions(from).iter().map(move |to| {
                    let transition = TransitionConfig::new([from], *to);
                    if from == StepStatus::Running && *to == StepStatus::Running {
                        transition
                            .with_guard(|ctx: &StepMachineContext| ctx.retry_count < ctx.max_retries)
                            .with_action(|ctx: &mut StepMachineContext, _, _| {
                                ctx.retry_count += 1;
                                Ok(())
                            })
                    } else {
                        transition
                    }
                })
            })
            .collect();

        let machine = StateMachine::new(StateMachineConfig {
            id: format!("step:{step_id}"),
            initial: StepStatus::Pending,
            states,
            transitions,
            context: StepMachineContext {
                step_id,
                retry_count: 0,
                max_retries,
                started_at: None,
                completed_at: None,
            },
            history: HistoryConfig::default(),
        })?;
        Ok(Self { machine })
    }

    pub fn status(&self) -> StepStatus {
        self.machine.current_state()
    }

    pub fn retry_count(&self) -> u32 {
        self.machine.context().retry_count
    }

    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        self.machine.can_transition_to(target)
    }

    pub fn transition(&self, target: StepStatus, trigger: Option<&str>) -> Result<bool, StateMachineError> {
        self.machine.transition(target, trigger)
    }

    /// Take the retry self-loop. Returns `false` unless the step is RUNNING
    /// and below its retry ceiling.
    pub fn retry(&self) -> Result<bool, StateMachineError> {
        self.machine
            .transition_with(StepStatus::Running, Some("retry"), |from, _| {
                from == StepStatus::Running
            })
    }

    pub fn is_final(&self) -> bool {
        self.machine.is_final_state()
    }

    pub fn context(&self) -> StepMachineContext {
        self.machine.context()
    }
}
