//! Workflow domain types for Taskflow.
//!
//! Defines the canonical workflow representation (`WorkflowDefinition` and its
//! tagged `StepKind` variants), the lifecycle status enums shared by the state
//! machines and the engine, and the instance snapshot the engine hands out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// YAML files, JSON payloads, and the programmatic builder all produce this
/// struct. It is the single source of truth for a workflow's shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "release-pipeline").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of top-level steps forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Disabled workflows are rejected by the engine.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Draft workflows are executable but flagged for tooling.
    #[serde(default)]
    pub draft: bool,
    /// Whole-instance timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    /// Create an enabled, non-draft definition with no steps.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            steps: Vec::new(),
            enabled: true,
            draft: false,
            timeout_ms: None,
            metadata: HashMap::new(),
        }
    }

    /// Iterate over every step in the definition, depth first, including
    /// children of parallel, condition and loop steps.
    pub fn all_steps(&self) -> Vec<&StepDefinition> {
        let mut out = Vec::new();
        for step in &self.steps {
            collect_steps(step, &mut out);
        }
        out
    }
}

fn collect_steps<'a>(step: &'a StepDefinition, out: &mut Vec<&'a StepDefinition>) {
    out.push(step);
    for child in step.kind.children() {
        collect_steps(child, out);
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// User-defined step ID, unique within the workflow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Step-specific configuration, tagged by `type`.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Sibling step IDs that must reach a terminal state first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Skip condition: the step runs only when this evaluates true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Retry policy applied to failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// What a failure of this step does to the enclosing step list.
    #[serde(default)]
    pub on_error: ErrorPolicy,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepDefinition {
    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            depends_on: Vec::new(),
            condition: None,
            retry: None,
            on_error: ErrorPolicy::Fail,
            timeout_ms: None,
        }
    }

    /// An agent step dispatching `task_type` work to `agent_type`.
    pub fn agent(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        task_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::with_kind(
            id,
            StepKind::Agent {
                agent_type: agent_type.into(),
                task_type: task_type.into(),
                payload,
            },
        )
    }

    /// A group of child steps executed concurrently.
    pub fn parallel(id: impl Into<String>, steps: Vec<StepDefinition>, fail_fast: bool) -> Self {
        Self::with_kind(id, StepKind::Parallel { steps, fail_fast })
    }

    /// An if/else branch over child step lists.
    pub fn branch(
        id: impl Into<String>,
        predicate: Condition,
        then_steps: Vec<StepDefinition>,
        else_steps: Vec<StepDefinition>,
    ) -> Self {
        Self::with_kind(
            id,
            StepKind::Condition {
                predicate,
                then_steps,
                else_steps,
            },
        )
    }

    /// A `FOR_EACH` loop running `steps` once per element of `items`.
    pub fn for_each(
        id: impl Into<String>,
        items: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Self {
        Self::with_kind(
            id,
            StepKind::Loop {
                items: items.into(),
                loop_type: LoopType::ForEach,
                steps,
                max_iterations: None,
            },
        )
    }

    /// Suspend this execution path for `duration_ms`.
    pub fn wait(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::with_kind(
            id,
            StepKind::Wait {
                wait_type: WaitType::Duration,
                duration_ms,
            },
        )
    }

    /// Copy values into the instance variable scope.
    pub fn transform(id: impl Into<String>, mappings: Vec<TransformMapping>) -> Self {
        Self::with_kind(id, StepKind::Transform { mappings })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_on_error(mut self, on_error: ErrorPolicy) -> Self {
        self.on_error = on_error;
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Cap the number of iterations of a loop step. No-op for other kinds.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        if let StepKind::Loop { max_iterations, .. } = &mut self.kind {
            *max_iterations = Some(max);
        }
        self
    }

    /// Name if set, otherwise the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    Parallel,
    Condition,
    Loop,
    Wait,
    Transform,
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type` and flattened into `StepDefinition`:
/// ```yaml
/// id: build
/// type: agent
/// agent_type: builder
/// task_type: compile
/// payload:
///   target: "${inputs.target}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Dispatch a templated payload to an external agent.
    Agent {
        agent_type: String,
        task_type: String,
        #[serde(default)]
        payload: Value,
    },
    /// Run child steps concurrently.
    Parallel {
        steps: Vec<StepDefinition>,
        #[serde(default)]
        fail_fast: bool,
    },
    /// Run exactly one of two child step lists.
    Condition {
        predicate: Condition,
        #[serde(default)]
        then_steps: Vec<StepDefinition>,
        #[serde(default)]
        else_steps: Vec<StepDefinition>,
    },
    /// Run child steps once per element of a resolved list.
    Loop {
        items: String,
        #[serde(default)]
        loop_type: LoopType,
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Suspend the current execution path.
    Wait {
        #[serde(default)]
        wait_type: WaitType,
        duration_ms: u64,
    },
    /// Write values into the instance variable scope.
    Transform { mappings: Vec<TransformMapping> },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Agent { .. } => StepType::Agent,
            StepKind::Parallel { .. } => StepType::Parallel,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Wait { .. } => StepType::Wait,
            StepKind::Transform { .. } => StepType::Transform,
        }
    }

    /// Direct child steps (both branches for a condition step).
    pub fn children(&self) -> Vec<&StepDefinition> {
        match self {
            StepKind::Parallel { steps, .. } | StepKind::Loop { steps, .. } => {
                steps.iter().collect()
            }
            StepKind::Condition {
                then_steps,
                else_steps,
                ..
            } => then_steps.iter().chain(else_steps.iter()).collect(),
            StepKind::Agent { .. } | StepKind::Wait { .. } | StepKind::Transform { .. } => {
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    #[default]
    ForEach,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    #[default]
    Duration,
}

/// A single field mapping for a transform step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformMapping {
    /// Scope path (`inputs.name`, `item.id`) or template (`${inputs.name}`).
    pub source: String,
    /// Variable name written in the instance scope.
    pub target: String,
    /// Accepted for compatibility; never evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Written when `source` does not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl TransformMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            expression: None,
            default_value: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// `left <operator> right`, where `left` is a template resolved against the
/// instance scope and `right` is a literal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub left: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub right: Value,
}

impl Condition {
    pub fn new(left: impl Into<String>, operator: ConditionOperator, right: Value) -> Self {
        Self {
            left: left.into(),
            operator,
            right,
        }
    }

    pub fn equals(left: impl Into<String>, right: Value) -> Self {
        Self::new(left, ConditionOperator::Equals, right)
    }

    pub fn not_equals(left: impl Into<String>, right: Value) -> Self {
        Self::new(left, ConditionOperator::NotEquals, right)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Exists,
}

// ---------------------------------------------------------------------------
// Retry and error policy
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
///
/// The delay before attempt `n + 1` is
/// `min(initial_delay_ms * backoff_multiplier^(n - 1), max_delay_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            ..Self::default()
        }
    }
}

/// Failure handling for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// A failure fails the enclosing step list (and the instance).
    #[default]
    Fail,
    /// A failure is recorded and execution continues.
    Continue,
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 7] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        WorkflowStatus::Paused,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
        WorkflowStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    Timeout,
}

impl StepStatus {
    pub const ALL: [StepStatus; 8] = [
        StepStatus::Pending,
        StepStatus::Waiting,
        StepStatus::Running,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Skipped,
        StepStatus::Cancelled,
        StepStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Waiting => "waiting",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Instance snapshot
// ---------------------------------------------------------------------------

/// Execution state of one step within an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of retries performed (0 for a first-attempt result).
    #[serde(default)]
    pub retry_count: u32,
}

/// Point-in-time view of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: WorkflowStatus,
    pub inputs: HashMap<String, Value>,
    /// Values bound by transform steps.
    pub variables: HashMap<String, Value>,
    /// Outputs of completed steps keyed by step ID.
    pub outputs: HashMap<String, Value>,
    /// Scheduled steps only; untaken branches never appear.
    pub step_states: HashMap<String, StepState>,
    /// Step IDs in the order they were first scheduled.
    pub execution_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// IDs of steps with `status`, in scheduling order.
    pub fn step_ids_with_status(&self, status: StepStatus) -> Vec<String> {
        self.execution_order
            .iter()
            .filter(|id| self.step_states.get(*id).is_some_and(|s| s.status == status))
            .cloned()
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Timeout
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
