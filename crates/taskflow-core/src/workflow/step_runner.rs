//! Step execution for every step kind.
//!
//! `StepRunner::run_list` drives one step list (top level, parallel group,
//! branch, or loop body): each step is spawned into a `JoinSet` as soon as
//! all of its dependencies are terminal. `run_step` drives a single step
//! through its state machine: skip condition, attempts with retry back-off
//! and per-attempt timeout, then a terminal transition.
//!
//! Every list and every attempt runs under a child `CancellationToken`.
//! Stopping work means cancelling a token and awaiting the tasks under it,
//! never dropping them, so each step records its own terminal state.
//!
//! Dependency skipping: a step whose dependency FAILED, TIMED OUT, was
//! CANCELLED, or was itself skipped for that reason is SKIPPED without
//! running. A step skipped by its own condition does not block dependents.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use taskflow_types::event::EngineEvent;
use taskflow_types::workflow::{
    ErrorPolicy, StepDefinition, StepKind, StepStatus, TransformMapping,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{ExecutionScope, INDEX_BINDING, ITEM_BINDING};
use super::dag::build_execution_plan;
use super::definition::WorkflowError;
use super::dispatch::{AgentTask, DispatchError};
use super::expression::ConditionEvaluator;
use super::instance::InstanceRuntime;
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a single step attempt (or a step list) did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("agent dispatch failed: {0}")]
    DispatchFailed(#[from] DispatchError),

    #[error("agent reported failure: {0}")]
    AgentReported(String),

    #[error("loop step '{step_id}' items did not resolve to a list (got {found})")]
    InvalidLoopItems { step_id: String, found: String },

    #[error("step timed out after {0} ms")]
    Timeout(u64),

    #[error("step cancelled")]
    Cancelled,

    #[error("step '{step_id}' failed: {error}")]
    ChildFailed { step_id: String, error: String },

    #[error("invalid step graph: {0}")]
    Plan(String),
}

impl From<WorkflowError> for StepError {
    fn from(err: WorkflowError) -> Self {
        StepError::Plan(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// How a step list reacts to a fatal child failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureMode {
    /// Start nothing further and cancel siblings in flight.
    FailFast,
    /// Run everything still reachable, report the first failure at the end.
    Aggregate,
}

#[derive(Debug, Clone)]
pub(crate) struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub on_error: ErrorPolicy,
}

impl StepResult {
    /// Failed, timed out, or cancelled: dependents are skipped.
    fn blocks_dependents(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Failed | StepStatus::Timeout | StepStatus::Cancelled
        )
    }

    fn is_fatal(&self) -> bool {
        self.status == StepStatus::Cancelled
            || (self.blocks_dependents() && self.on_error == ErrorPolicy::Fail)
    }

    fn to_error(&self) -> StepError {
        if self.status == StepStatus::Cancelled {
            return StepError::Cancelled;
        }
        StepError::ChildFailed {
            step_id: self.step_id.clone(),
            error: self
                .error
                .clone()
                .unwrap_or_else(|| self.status.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct StepRunner {
    rt: Arc<InstanceRuntime>,
    cancel: CancellationToken,
}

impl StepRunner {
    pub fn new(rt: Arc<InstanceRuntime>) -> Self {
        let cancel = rt.cancel.clone();
        Self { rt, cancel }
    }

    fn child(&self, cancel: CancellationToken) -> Self {
        Self {
            rt: Arc::clone(&self.rt),
            cancel,
        }
    }

    /// Run a step list, starting each step as soon as all of its
    /// dependencies are terminal.
    pub fn run_list(
        &self,
        steps: Vec<StepDefinition>,
        scope: ExecutionScope,
        mode: FailureMode,
    ) -> BoxFuture<'static, Result<Vec<StepResult>, StepError>> {
        let parent = self.clone();
        async move {
            // Wave order only breaks ties; readiness is checked per step.
            let mut pending: Vec<StepDefinition> = build_execution_plan(&steps)?
                .into_iter()
                .flatten()
                .cloned()
                .collect();

            // The list gets its own token so a failure can stop siblings
            // without cancelling the instance.
            let runner = parent.child(parent.cancel.child_token());

            let mut done: HashSet<String> = HashSet::new();
            let mut blocked: HashSet<String> = HashSet::new();
            let mut results = Vec::with_capacity(pending.len());
            let mut first_failure: Option<StepError> = None;
            let mut join_set = JoinSet::new();

            loop {
                while !runner.cancel.is_cancelled() {
                    let Some(pos) = pending
                        .iter()
                        .position(|s| s.depends_on.iter().all(|d| done.contains(d)))
                    else {
                        break;
                    };
                    let step = pending.remove(pos);
                    if let Some(dep) = step.depends_on.iter().find(|d| blocked.contains(*d)) {
                        let reason = format!("dependency '{dep}' did not complete");
                        runner.register(&step);
                        let result = runner.skip_step(&step, &reason);
                        blocked.insert(step.id.clone());
                        done.insert(step.id.clone());
                        results.push(result);
                        continue;
                    }
                    debug!(instance_id = %runner.rt.id, step_id = %step.id, "step ready");
                    join_set.spawn(runner.run_step(step, scope.clone()));
                }

                let Some(joined) = join_set.join_next().await else {
                    break;
                };
                let result = match joined {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(instance_id = %runner.rt.id, error = %err, "step task aborted");
                        first_failure
                            .get_or_insert(StepError::Plan(format!("step task join error: {err}")));
                        runner.cancel.cancel();
                        continue;
                    }
                };

                done.insert(result.step_id.clone());
                if result.blocks_dependents() {
                    blocked.insert(result.step_id.clone());
                    if !result.is_fatal() {
                        warn!(
                            instance_id = %runner.rt.id,
                            step_id = %result.step_id,
                            status = %result.status,
                            "step did not complete, continuing per on_error policy"
                        );
                    }
                }
                if result.is_fatal() && first_failure.is_none() {
                    first_failure = Some(result.to_error());
                    if mode == FailureMode::FailFast {
                        // Siblings observe the token and settle themselves;
                        // the loop keeps draining them.
                        runner.cancel.cancel();
                    }
                }
                results.push(result);
            }

            match first_failure {
                Some(err) => Err(err),
                None if !pending.is_empty() => Err(StepError::Cancelled),
                None => Ok(results),
            }
        }
        .boxed()
    }

    /// Move a registered PENDING step to SKIPPED.
    fn skip_step(&self, step: &StepDefinition, reason: &str) -> StepResult {
        self.rt
            .transition_step(&step.id, StepStatus::Skipped, Some(reason));
        debug!(instance_id = %self.rt.id, step_id = %step.id, reason, "step skipped");
        self.rt.events.publish(&EngineEvent::StepSkipped {
            instance_id: self.rt.id,
            step_id: step.id.clone(),
            reason: reason.to_string(),
        });
        StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Skipped,
            error: None,
            on_error: step.on_error,
        }
    }

    fn register(&self, step: &StepDefinition) {
        let max_retries = RetryHandler::max_attempts(step.retry.as_ref()) - 1;
        if let Err(err) = self.rt.register_step(&step.id, max_retries) {
            warn!(instance_id = %self.rt.id, step_id = %step.id, error = %err, "step machine rejected");
        }
    }

    /// Drive one step to a terminal state.
    pub fn run_step(
        &self,
        step: StepDefinition,
        scope: ExecutionScope,
    ) -> BoxFuture<'static, StepResult> {
        let runner = self.clone();
        async move {
            let rt = Arc::clone(&runner.rt);
            let finish = |status: StepStatus, error: Option<String>| StepResult {
                step_id: step.id.clone(),
                status,
                error,
                on_error: step.on_error,
            };

            runner.register(&step);

            if runner.cancel.is_cancelled() {
                rt.transition_step(&step.id, StepStatus::Cancelled, Some("cancelled"));
                return finish(StepStatus::Cancelled, None);
            }

            if let Some(condition) = &step.condition {
                if !ConditionEvaluator::evaluate(condition, &scope) {
                    return runner.skip_step(&step, "condition not met");
                }
            }

            if rt.is_paused() {
                rt.transition_step(&step.id, StepStatus::Waiting, Some("paused"));
                rt.wait_while_paused(&runner.cancel).await;
            }

            if runner.cancel.is_cancelled() {
                if rt.step_status(&step.id) == Some(StepStatus::Waiting) {
                    rt.transition_step(&step.id, StepStatus::Running, Some("cancelled"));
                }
                rt.transition_step(&step.id, StepStatus::Cancelled, Some("cancelled"));
                return finish(StepStatus::Cancelled, None);
            }

            rt.transition_step(&step.id, StepStatus::Running, Some("start"));
            let timeout_ms = step
                .timeout_ms
                .or(rt.default_step_timeout.map(|d| d.as_millis() as u64));
            let started = Instant::now();
            let mut attempt: u32 = 1;

            loop {
                rt.events.publish(&EngineEvent::StepStarted {
                    instance_id: rt.id,
                    step_id: step.id.clone(),
                    step_type: step.step_type(),
                    attempt,
                });

                let outcome = runner.attempt(&step, &scope, attempt, timeout_ms).await;

                match outcome {
                    Ok(output) => {
                        let stored = scope.set_step_output(&step.id, output);
                        rt.update_step(&step.id, |s| s.output = Some(stored));
                        rt.transition_step(&step.id, StepStatus::Completed, Some("success"));
                        rt.events.publish(&EngineEvent::StepCompleted {
                            instance_id: rt.id,
                            step_id: step.id.clone(),
                            duration_ms: started.elapsed().as_millis() as u64,
                        });
                        return finish(StepStatus::Completed, None);
                    }
                    Err(StepError::Cancelled) => {
                        rt.transition_step(&step.id, StepStatus::Cancelled, Some("cancelled"));
                        rt.update_step(&step.id, |s| s.error = Some(StepError::Cancelled.to_string()));
                        return finish(StepStatus::Cancelled, Some(StepError::Cancelled.to_string()));
                    }
                    Err(err) => {
                        let message = err.to_string();
                        let will_retry = RetryHandler::should_retry(step.retry.as_ref(), attempt);
                        rt.events.publish(&EngineEvent::StepFailed {
                            instance_id: rt.id,
                            step_id: step.id.clone(),
                            error: message.clone(),
                            attempt,
                            will_retry,
                        });
                        rt.update_step(&step.id, |s| s.error = Some(message.clone()));

                        if will_retry {
                            if let Some(policy) = &step.retry {
                                let delay = RetryHandler::delay_for_attempt(policy, attempt);
                                debug!(
                                    instance_id = %rt.id,
                                    step_id = %step.id,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    "retrying step"
                                );
                                if !runner.sleep(delay).await {
                                    rt.transition_step(&step.id, StepStatus::Cancelled, Some("cancelled"));
                                    return finish(StepStatus::Cancelled, Some(message));
                                }
                                rt.wait_while_paused(&runner.cancel).await;
                            }
                            if rt.retry_step(&step.id) {
                                attempt += 1;
                                continue;
                            }
                        }

                        let status = match err {
                            StepError::Timeout(_) => StepStatus::Timeout,
                            _ => StepStatus::Failed,
                        };
                        rt.transition_step(&step.id, status, Some(message.as_str()));
                        return finish(status, Some(message));
                    }
                }
            }
        }
        .boxed()
    }

    /// One attempt, bounded by the step timeout and the cancel token.
    ///
    /// An interrupted attempt cancels its own token and is then awaited, so
    /// child steps of a group, branch, or loop reach a terminal state before
    /// the attempt returns.
    async fn attempt(
        &self,
        step: &StepDefinition,
        scope: &ExecutionScope,
        attempt: u32,
        timeout_ms: Option<u64>,
    ) -> Result<Value, StepError> {
        let attempt_cancel = self.cancel.child_token();
        let runner = self.child(attempt_cancel.clone());
        let work = runner.execute_kind(step, scope, attempt);
        tokio::pin!(work);

        let deadline = async {
            match timeout_ms {
                Some(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    ms
                }
                None => std::future::pending().await,
            }
        };

        let interrupted = tokio::select! {
            result = &mut work => return result,
            ms = deadline => StepError::Timeout(ms),
            _ = self.cancel.cancelled() => StepError::Cancelled,
        };
        attempt_cancel.cancel();
        if let Err(err) = work.await {
            debug!(
                instance_id = %self.rt.id,
                step_id = %step.id,
                error = %err,
                "interrupted attempt wound down"
            );
        }
        Err(interrupted)
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn execute_kind(
        &self,
        step: &StepDefinition,
        scope: &ExecutionScope,
        attempt: u32,
    ) -> Result<Value, StepError> {
        match &step.kind {
            StepKind::Agent {
                agent_type,
                task_type,
                payload,
            } => {
                let resolved = scope.resolve_value(payload);
                self.rt
                    .update_step(&step.id, |s| s.input = Some(resolved.clone()));
                let dispatch = self.rt.dispatcher.dispatch(AgentTask {
                    instance_id: self.rt.id,
                    workflow_id: self.rt.definition.id.clone(),
                    step_id: step.id.clone(),
                    agent_type: agent_type.clone(),
                    task_type: task_type.clone(),
                    payload: resolved,
                    attempt,
                });
                let outcome = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                    outcome = dispatch => outcome?,
                };
                if outcome.success {
                    Ok(outcome.data)
                } else {
                    Err(StepError::AgentReported(
                        outcome
                            .error
                            .unwrap_or_else(|| "agent reported failure".to_string()),
                    ))
                }
            }

            StepKind::Parallel { steps, fail_fast } => {
                let mode = if *fail_fast {
                    FailureMode::FailFast
                } else {
                    FailureMode::Aggregate
                };
                let results = self.run_list(steps.clone(), scope.clone(), mode).await?;
                Ok(collect_outputs(&results, scope))
            }

            StepKind::Condition {
                predicate,
                then_steps,
                else_steps,
            } => {
                let matched = ConditionEvaluator::evaluate(predicate, scope);
                let branch = if matched { then_steps } else { else_steps };
                debug!(
                    instance_id = %self.rt.id,
                    step_id = %step.id,
                    matched,
                    "condition branch selected"
                );
                let results = self
                    .run_list(branch.clone(), scope.clone(), FailureMode::FailFast)
                    .await?;
                Ok(json!({
                    "condition_met": matched,
                    "branch": if matched { "then" } else { "else" },
                    "outputs": collect_outputs(&results, scope),
                }))
            }

            StepKind::Loop {
                items,
                steps,
                max_iterations,
                ..
            } => {
                let list = match scope.resolve_optional(items) {
                    Some(Value::Array(list)) => list,
                    other => {
                        return Err(StepError::InvalidLoopItems {
                            step_id: step.id.clone(),
                            found: other.map_or_else(|| "nothing".to_string(), |v| v.to_string()),
                        });
                    }
                };
                let total_items = list.len();
                let cap = max_iterations.map_or(total_items, |m| m as usize);
                if total_items > cap {
                    warn!(
                        instance_id = %self.rt.id,
                        step_id = %step.id,
                        items = total_items,
                        max_iterations = cap,
                        "loop iteration cap reached, remaining items not processed"
                    );
                }

                let mut iterations = Vec::new();
                for (index, item) in list.into_iter().take(cap).enumerate() {
                    if self.cancel.is_cancelled() {
                        return Err(StepError::Cancelled);
                    }
                    self.rt.wait_while_paused(&self.cancel).await;
                    let iteration_scope = scope
                        .with_local(ITEM_BINDING, item)
                        .with_local(INDEX_BINDING, json!(index));
                    let results = self
                        .run_list(steps.clone(), iteration_scope, FailureMode::FailFast)
                        .await?;
                    iterations.push(collect_outputs(&results, scope));
                }
                Ok(json!({
                    "iterations": iterations.len(),
                    "total_items": total_items,
                    "outputs": iterations,
                }))
            }

            StepKind::Wait { duration_ms, .. } => {
                if self.sleep(Duration::from_millis(*duration_ms)).await {
                    Ok(json!({ "waited_ms": duration_ms }))
                } else {
                    Err(StepError::Cancelled)
                }
            }

            StepKind::Transform { mappings } => Ok(self.apply_transform(&step.id, mappings, scope)),
        }
    }

    fn apply_transform(
        &self,
        step_id: &str,
        mappings: &[TransformMapping],
        scope: &ExecutionScope,
    ) -> Value {
        let mut written = Map::new();
        for mapping in mappings {
            if let Some(expression) = &mapping.expression {
                debug!(
                    instance_id = %self.rt.id,
                    step_id,
                    target = %mapping.target,
                    expression = %expression,
                    "transform expression is not evaluated"
                );
            }
            let value = scope
                .resolve_source(&mapping.source)
                .or_else(|| mapping.default_value.clone())
                .unwrap_or(Value::Null);
            scope.set_variable(&mapping.target, value.clone());
            written.insert(mapping.target.clone(), value);
        }
        info!(
            instance_id = %self.rt.id,
            step_id,
            variables = written.len(),
            "transform applied"
        );
        Value::Object(written)
    }
}

/// Outputs of the completed steps in `results`, keyed by step ID.
fn collect_outputs(results: &[StepResult], scope: &ExecutionScope) -> Value {
    let mut outputs = Map::new();
    for result in results {
        if result.status == StepStatus::Completed {
            if let Some(output) = scope.step_output(&result.step_id) {
                outputs.insert(result.step_id.clone(), output);
            }
        }
    }
    Value::Object(outputs)
}
