//! Workflow execution engine.
//!
//! `WorkflowEngine` admits instances up to `max_concurrent_workflows`, runs
//! each one's top-level steps through the step runner, finalizes the
//! workflow state machine, and keeps finished instances queryable until the
//! retention limit evicts them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskflow_types::config::EngineConfig;
use taskflow_types::event::EngineEvent;
use taskflow_types::workflow::{StepStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dag::validate_dag;
use super::definition::{WorkflowError, validate_definition};
use super::dispatch::{AgentDispatcher, BoxAgentDispatcher};
use super::instance::InstanceRuntime;
use super::step_runner::{FailureMode, StepRunner};
use crate::event::{EventBus, SubscriptionId};
use crate::state_machine::StateMachineError;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned before an instance exists, or from instance controls.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("maximum concurrent workflows ({0}) reached")]
    MaxConcurrentWorkflows(usize),

    #[error("workflow '{0}' is disabled")]
    WorkflowDisabled(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] WorkflowError),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

// ---------------------------------------------------------------------------
// EngineStats
// ---------------------------------------------------------------------------

/// Running totals since the engine was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Instances currently holding an admission permit.
    pub active: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflow definitions against a host-supplied agent dispatcher.
pub struct WorkflowEngine {
    config: EngineConfig,
    dispatcher: BoxAgentDispatcher,
    admission: Arc<Semaphore>,
    /// Live and retained instances keyed by instance ID.
    instances: DashMap<Uuid, Arc<InstanceRuntime>>,
    /// Finished instance IDs, oldest first.
    finished: Mutex<VecDeque<Uuid>>,
    events: EventBus<EngineEvent>,
    counters: Counters,
    started: Instant,
}

impl WorkflowEngine {
    pub fn new<D: AgentDispatcher>(config: EngineConfig, dispatcher: D) -> Self {
        Self::with_dispatcher(config, BoxAgentDispatcher::new(dispatcher))
    }

    pub fn with_dispatcher(config: EngineConfig, dispatcher: BoxAgentDispatcher) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent_workflows)),
            config,
            dispatcher,
            instances: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            events: EventBus::new(),
            counters: Counters::default(),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `definition` to a terminal state and return the final snapshot.
    ///
    /// Fails without creating an instance when the workflow is disabled,
    /// invalid, or the concurrency limit is reached. Every other failure is
    /// reported through the returned instance's `status` and `error`.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: HashMap<String, Value>,
    ) -> Result<WorkflowInstance, EngineError> {
        if !definition.enabled {
            return Err(EngineError::WorkflowDisabled(definition.id.clone()));
        }
        validate_definition(definition)?;

        let _permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| {
                warn!(
                    workflow_id = %definition.id,
                    limit = self.config.max_concurrent_workflows,
                    "workflow rejected by admission control"
                );
                EngineError::MaxConcurrentWorkflows(self.config.max_concurrent_workflows)
            })?;

        let rt = Arc::new(InstanceRuntime::new(
            Arc::new(definition.clone()),
            inputs,
            self.events.clone(),
            self.dispatcher.clone(),
            self.config.default_step_timeout_ms.map(Duration::from_millis),
        )?);
        self.instances.insert(rt.id, Arc::clone(&rt));
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        rt.machine.transition(WorkflowStatus::Running, Some("start"))?;
        self.events.publish(&EngineEvent::WorkflowStarted {
            instance_id: rt.id,
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
        });
        info!(
            instance_id = %rt.id,
            workflow_id = %definition.id,
            steps = definition.steps.len(),
            "workflow started"
        );

        let outcome = match validate_dag(&definition.steps) {
            Ok(()) => self.run(&rt).await,
            Err(err) => Err(err.to_string()),
        };
        self.finalize(&rt, outcome)?;
        self.retire(rt.id);

        Ok(rt.snapshot())
    }

    /// Drive the top-level step list, racing the workflow timeout if set.
    async fn run(&self, rt: &Arc<InstanceRuntime>) -> Result<(), String> {
        let runner = StepRunner::new(Arc::clone(rt));
        let mut work = runner.run_list(
            rt.definition.steps.clone(),
            rt.scope.clone(),
            FailureMode::FailFast,
        );

        let result = match rt.definition.timeout_ms {
            Some(ms) => {
                tokio::select! {
                    result = &mut work => result,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        warn!(instance_id = %rt.id, timeout_ms = ms, "workflow timed out");
                        if let Err(err) = rt.time_out(ms) {
                            warn!(instance_id = %rt.id, error = %err, "timeout transition failed");
                        }
                        // Steps observe the cancelled token and wind down.
                        work.await
                    }
                }
            }
            None => work.await,
        };
        result.map(|_| ()).map_err(|err| err.to_string())
    }

    fn finalize(&self, rt: &InstanceRuntime, outcome: Result<(), String>) -> Result<(), EngineError> {
        match rt.status() {
            WorkflowStatus::Cancelled => {
                rt.settle_open_steps(StepStatus::Cancelled);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(instance_id = %rt.id, "workflow cancelled");
                return Ok(());
            }
            WorkflowStatus::Timeout => {
                rt.settle_open_steps(StepStatus::Timeout);
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            _ => {}
        }

        rt.leave_paused("finish")?;
        match outcome {
            Ok(()) => {
                rt.settle_open_steps(StepStatus::Cancelled);
                rt.machine.transition(WorkflowStatus::Completed, Some("complete"))?;
                let duration_ms = rt.elapsed_ms();
                let steps_completed = rt.count_steps(StepStatus::Completed);
                self.events.publish(&EngineEvent::WorkflowCompleted {
                    instance_id: rt.id,
                    workflow_id: rt.definition.id.clone(),
                    duration_ms,
                    steps_completed,
                });
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    instance_id = %rt.id,
                    duration_ms,
                    steps_completed,
                    "workflow completed"
                );
            }
            Err(error) => {
                rt.machine.fail(error.clone())?;
                rt.settle_open_steps(StepStatus::Cancelled);
                self.events.publish(&EngineEvent::WorkflowFailed {
                    instance_id: rt.id,
                    workflow_id: rt.definition.id.clone(),
                    error: error.clone(),
                });
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(instance_id = %rt.id, error = %error, "workflow failed");
            }
        }
        Ok(())
    }

    /// Record a finished instance and evict the oldest beyond the retention limit.
    fn retire(&self, instance_id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.push_back(instance_id);
            let excess = finished.len().saturating_sub(self.config.max_retained_instances);
            finished.drain(..excess).collect()
        };
        for id in evicted {
            self.instances.remove(&id);
            debug!(instance_id = %id, "evicted retained instance");
        }
    }

    // -- instance controls --

    fn runtime(&self, instance_id: Uuid) -> Result<Arc<InstanceRuntime>, EngineError> {
        self.instances
            .get(&instance_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Pause a running instance. Steps already running finish; no new step
    /// starts until resumed. Returns `false` when the instance is not running.
    pub fn pause(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let paused = self.runtime(instance_id)?.pause()?;
        if !paused {
            warn!(instance_id = %instance_id, "pause ignored, instance not running");
        }
        Ok(paused)
    }

    pub fn resume(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let resumed = self.runtime(instance_id)?.resume()?;
        if !resumed {
            warn!(instance_id = %instance_id, "resume ignored, instance not paused");
        }
        Ok(resumed)
    }

    /// Cancel a live instance. Returns `false` when it already finished.
    pub fn cancel(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let cancelled = self.runtime(instance_id)?.cancel()?;
        if !cancelled {
            warn!(instance_id = %instance_id, "cancel ignored, instance already finished");
        }
        Ok(cancelled)
    }

    pub fn get_instance(&self, instance_id: Uuid) -> Option<WorkflowInstance> {
        self.runtime(instance_id).ok().map(|rt| rt.snapshot())
    }

    /// Snapshots of every live and retained instance, oldest first.
    pub fn list_instances(&self) -> Vec<WorkflowInstance> {
        let runtimes: Vec<Arc<InstanceRuntime>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<WorkflowInstance> =
            runtimes.iter().map(|rt| rt.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub fn get_stats(&self) -> EngineStats {
        let active = self
            .config
            .max_concurrent_workflows
            .saturating_sub(self.admission.available_permits());
        EngineStats {
            total_executions: self.counters.total.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            active: active as u64,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    // -- events --

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}
