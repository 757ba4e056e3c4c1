//! Live state of one workflow instance.
//!
//! `InstanceRuntime` owns the workflow state machine, one step state machine
//! per scheduled step, the mirrored `StepState` records handed out in
//! snapshots, the variable scope, and the pause/cancel controls. Every
//! status change goes through a state machine; the `StepState` mirror is
//! only updated after the machine accepted the transition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskflow_types::event::EngineEvent;
use taskflow_types::workflow::{
    StepState, StepStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::context::ExecutionScope;
use super::dispatch::BoxAgentDispatcher;
use crate::event::EventBus;
use crate::state_machine::{StateMachineError, StepStateMachine, WorkflowStateMachine};

#[derive(Default)]
struct StepTable {
    states: HashMap<String, StepState>,
    machines: HashMap<String, StepStateMachine>,
    order: Vec<String>,
    current: Option<String>,
}

pub(crate) struct InstanceRuntime {
    pub id: Uuid,
    pub definition: Arc<WorkflowDefinition>,
    pub machine: WorkflowStateMachine,
    pub scope: ExecutionScope,
    pub cancel: CancellationToken,
    pub events: EventBus<EngineEvent>,
    pub dispatcher: BoxAgentDispatcher,
    pub default_step_timeout: Option<Duration>,
    steps: Mutex<StepTable>,
    pause_gate: watch::Sender<bool>,
    created_at: DateTime<Utc>,
    started: Instant,
}

impl InstanceRuntime {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        inputs: HashMap<String, Value>,
        events: EventBus<EngineEvent>,
        dispatcher: BoxAgentDispatcher,
        default_step_timeout: Option<Duration>,
    ) -> Result<Self, StateMachineError> {
        let id = Uuid::now_v7();
        let machine = WorkflowStateMachine::new(definition.id.clone(), id)?;
        let (pause_gate, _) = watch::channel(false);
        Ok(Self {
            id,
            definition,
            machine,
            scope: ExecutionScope::new(inputs),
            cancel: CancellationToken::new(),
            events,
            dispatcher,
            default_step_timeout,
            steps: Mutex::new(StepTable::default()),
            pause_gate,
            created_at: Utc::now(),
            started: Instant::now(),
        })
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn status(&self) -> WorkflowStatus {
        self.machine.status()
    }

    // -- workflow controls --

    /// RUNNING -> PAUSED. New steps wait at the gate until resumed.
    pub fn pause(&self) -> Result<bool, StateMachineError> {
        if !self.machine.transition(WorkflowStatus::Paused, Some("pause"))? {
            return Ok(false);
        }
        self.pause_gate.send_replace(true);
        self.events
            .publish(&EngineEvent::WorkflowPaused { instance_id: self.id });
        Ok(true)
    }

    /// PAUSED -> RUNNING.
    pub fn resume(&self) -> Result<bool, StateMachineError> {
        if self.machine.status() != WorkflowStatus::Paused
            || !self.machine.transition(WorkflowStatus::Running, Some("resume"))?
        {
            return Ok(false);
        }
        self.pause_gate.send_replace(false);
        self.events
            .publish(&EngineEvent::WorkflowResumed { instance_id: self.id });
        Ok(true)
    }

    /// Move to CANCELLED (through RUNNING when paused) and signal every step.
    pub fn cancel(&self) -> Result<bool, StateMachineError> {
        if !self.leave_paused("cancel")?
            || !self.machine.transition(WorkflowStatus::Cancelled, Some("cancel"))?
        {
            return Ok(false);
        }
        self.cancel.cancel();
        self.events
            .publish(&EngineEvent::WorkflowCancelled { instance_id: self.id });
        Ok(true)
    }

    /// Move to TIMEOUT (through RUNNING when paused) and signal every step.
    pub fn time_out(&self, timeout_ms: u64) -> Result<bool, StateMachineError> {
        if !self.leave_paused("timeout")?
            || !self.machine.transition(WorkflowStatus::Timeout, Some("timeout"))?
        {
            return Ok(false);
        }
        self.cancel.cancel();
        self.events.publish(&EngineEvent::WorkflowTimedOut {
            instance_id: self.id,
            timeout_ms,
        });
        Ok(true)
    }

    /// PAUSED -> RUNNING so a terminal transition becomes legal. Returns
    /// `false` only when the machine refused to leave PAUSED.
    pub fn leave_paused(&self, trigger: &str) -> Result<bool, StateMachineError> {
        if self.machine.status() != WorkflowStatus::Paused {
            return Ok(true);
        }
        let resumed = self.machine.transition(WorkflowStatus::Running, Some(trigger))?;
        if resumed {
            self.pause_gate.send_replace(false);
        }
        Ok(resumed)
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_gate.borrow()
    }

    /// Wait until the instance is not paused or `cancel` fires.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) {
        let mut gate = self.pause_gate.subscribe();
        loop {
            if !*gate.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // -- step bookkeeping --

    /// Schedule a step: a fresh PENDING machine and state record. Loop
    /// bodies re-register their steps each iteration.
    pub fn register_step(&self, step_id: &str, max_retries: u32) -> Result<(), StateMachineError> {
        let machine = StepStateMachine::new(step_id, max_retries)?;
        let mut table = self.lock_steps();
        if !table.states.contains_key(step_id) {
            table.order.push(step_id.to_string());
        }
        table.states.insert(
            step_id.to_string(),
            StepState {
                step_id: step_id.to_string(),
                status: StepStatus::Pending,
                ..Default::default()
            },
        );
        table.machines.insert(step_id.to_string(), machine);
        Ok(())
    }

    /// Drive a step's machine and mirror the result. Returns whether the
    /// transition was taken.
    pub fn transition_step(&self, step_id: &str, target: StepStatus, trigger: Option<&str>) -> bool {
        self.drive_step(step_id, target, |machine| machine.transition(target, trigger))
    }

    /// Take the RUNNING -> RUNNING retry loop.
    pub fn retry_step(&self, step_id: &str) -> bool {
        self.drive_step(step_id, StepStatus::Running, StepStateMachine::retry)
    }

    fn drive_step<F>(&self, step_id: &str, target: StepStatus, drive: F) -> bool
    where
        F: FnOnce(&StepStateMachine) -> Result<bool, StateMachineError>,
    {
        let mut table = self.lock_steps();
        let Some(machine) = table.machines.get(step_id) else {
            warn!(instance_id = %self.id, step_id, "transition for unscheduled step");
            return false;
        };
        let taken = match drive(machine) {
            Ok(taken) => taken,
            Err(err) => {
                warn!(instance_id = %self.id, step_id, error = %err, "step transition failed");
                false
            }
        };
        if !taken {
            debug!(instance_id = %self.id, step_id, to = %target, "step transition refused");
            return false;
        }
        let ctx = machine.context();
        if target == StepStatus::Running {
            table.current = Some(step_id.to_string());
        }
        if let Some(state) = table.states.get_mut(step_id) {
            state.status = target;
            state.retry_count = ctx.retry_count;
            state.started_at = ctx.started_at;
            state.completed_at = ctx.completed_at;
        }
        true
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.lock_steps().states.get(step_id).map(|s| s.status)
    }

    pub fn update_step<F>(&self, step_id: &str, f: F)
    where
        F: FnOnce(&mut StepState),
    {
        if let Some(state) = self.lock_steps().states.get_mut(step_id) {
            f(state);
        }
    }

    /// Move every non-terminal step to a terminal state once the instance
    /// has stopped: RUNNING steps take `running_target`, the rest CANCELLED.
    pub fn settle_open_steps(&self, running_target: StepStatus) {
        let open: Vec<(String, StepStatus)> = {
            let table = self.lock_steps();
            table
                .order
                .iter()
                .filter_map(|id| table.states.get(id).map(|s| (id.clone(), s.status)))
                .filter(|(_, status)| {
                    !crate::state_machine::is_step_status_final(*status)
                })
                .collect()
        };
        for (step_id, status) in open {
            match status {
                StepStatus::Running => {
                    self.transition_step(&step_id, running_target, Some("instance stopped"));
                }
                StepStatus::Waiting => {
                    self.transition_step(&step_id, StepStatus::Running, Some("instance stopped"));
                    self.transition_step(&step_id, StepStatus::Cancelled, Some("instance stopped"));
                }
                _ => {
                    self.transition_step(&step_id, StepStatus::Cancelled, Some("instance stopped"));
                }
            }
        }
    }

    pub fn count_steps(&self, status: StepStatus) -> u32 {
        self.lock_steps()
            .states
            .values()
            .filter(|s| s.status == status)
            .count() as u32
    }

    pub fn snapshot(&self) -> WorkflowInstance {
        let table = self.lock_steps();
        let ctx = self.machine.context();
        WorkflowInstance {
            id: self.id,
            workflow_id: self.definition.id.clone(),
            workflow_name: self.definition.name.clone(),
            workflow_version: self.definition.version.clone(),
            status: self.machine.status(),
            inputs: self.scope.inputs(),
            variables: self.scope.variables(),
            outputs: self.scope.step_outputs(),
            step_states: table.states.clone(),
            execution_order: table.order.clone(),
            current_step_id: table.current.clone(),
            error: ctx.error,
            created_at: self.created_at,
            started_at: ctx.started_at,
            completed_at: ctx.completed_at,
        }
    }

    fn lock_steps(&self) -> std::sync::MutexGuard<'_, StepTable> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::dispatch::{AgentDispatcher, AgentOutcome, AgentTask, DispatchError};
    use serde_json::json;
    use taskflow_types::workflow::StepDefinition;

    struct Noop;

    impl AgentDispatcher for Noop {
        async fn dispatch(&self, _task: AgentTask) -> Result<AgentOutcome, DispatchError> {
            Ok(AgentOutcome::success(Value::Null))
        }
    }

    fn runtime() -> InstanceRuntime {
        let mut def = WorkflowDefinition::new("wf", "Workflow");
        def.steps = vec![StepDefinition::wait("a", 1)];
        InstanceRuntime::new(
            Arc::new(def),
            HashMap::from([("x".to_string(), json!(1))]),
            EventBus::new(),
            BoxAgentDispatcher::new(Noop),
            None,
        )
        .unwrap()
    }

    #[test]
    fn step_mirror_follows_machine() {
        let rt = runtime();
        rt.register_step("a", 1).unwrap();
        assert_eq!(rt.step_status("a"), Some(StepStatus::Pending));
        assert!(!rt.transition_step("a", StepStatus::Completed, None));
        assert!(!rt.retry_step("a"));
        assert_eq!(rt.step_status("a"), Some(StepStatus::Pending));
        assert!(rt.transition_step("a", StepStatus::Running, None));
        assert!(rt.retry_step("a"));
        assert!(!rt.retry_step("a"));
        assert!(rt.transition_step("a", StepStatus::Completed, None));

        let snap = rt.snapshot();
        let state = snap.step("a").unwrap();
        assert_eq!(state.status, StepStatus::Completed);
        assert_eq!(state.retry_count, 1);
        assert!(state.started_at.is_some());
        assert!(state.completed_at.is_some());
        assert_eq!(snap.current_step_id.as_deref(), Some("a"));
        assert_eq!(snap.inputs["x"], json!(1));
    }

    #[test]
    fn reregistration_keeps_first_order_position() {
        let rt = runtime();
        rt.register_step("a", 0).unwrap();
        rt.register_step("b", 0).unwrap();
        rt.transition_step("a", StepStatus::Skipped, None);
        rt.register_step("a", 0).unwrap();
        let snap = rt.snapshot();
        assert_eq!(snap.execution_order, vec!["a", "b"]);
        assert_eq!(snap.step("a").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn cancel_from_paused_goes_through_running() {
        let rt = runtime();
        rt.machine.transition(WorkflowStatus::Running, None).unwrap();
        assert!(rt.pause().unwrap());
        assert!(rt.is_paused());
        assert!(rt.cancel().unwrap());
        assert_eq!(rt.status(), WorkflowStatus::Cancelled);
        assert!(rt.cancel.is_cancelled());
        assert!(!rt.is_paused());
        assert!(!rt.resume().unwrap());
    }

    #[test]
    fn settle_open_steps_terminates_everything() {
        let rt = runtime();
        for id in ["run", "wait", "pend"] {
            rt.register_step(id, 0).unwrap();
        }
        rt.transition_step("run", StepStatus::Running, None);
        rt.transition_step("wait", StepStatus::Waiting, None);
        rt.settle_open_steps(StepStatus::Timeout);

        let snap = rt.snapshot();
        assert_eq!(snap.step("run").unwrap().status, StepStatus::Timeout);
        assert_eq!(snap.step("wait").unwrap().status, StepStatus::Cancelled);
        assert_eq!(snap.step("pend").unwrap().status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn pause_gate_releases_on_resume() {
        let rt = Arc::new(runtime());
        rt.machine.transition(WorkflowStatus::Running, None).unwrap();
        rt.pause().unwrap();

        let waiter = {
            let rt = Arc::clone(&rt);
            tokio::spawn(async move {
                let token = rt.cancel.clone();
                rt.wait_while_paused(&token).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        rt.resume().unwrap();
        waiter.await.unwrap();
    }
}
