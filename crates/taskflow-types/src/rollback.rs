//! Checkpoint and rollback types for Taskflow.
//!
//! A checkpoint captures a `WorkflowStateSnapshot` by value. Every nested
//! collection is owned, so a stored snapshot never shares data with the
//! caller's copy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{StepState, StepStatus, WorkflowInstance, WorkflowStatus};

// ---------------------------------------------------------------------------
// State snapshot
// ---------------------------------------------------------------------------

/// The rollback-facing shape of a workflow instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStateSnapshot {
    pub workflow_id: String,
    pub instance_id: Uuid,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    #[serde(default)]
    pub failed_step_ids: Vec<String>,
    #[serde(default)]
    pub skipped_step_ids: Vec<String>,
}

impl WorkflowStateSnapshot {
    /// An empty-progress snapshot for a freshly started instance.
    pub fn new(workflow_id: impl Into<String>, instance_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            instance_id,
            ..Default::default()
        }
    }
}

impl From<&WorkflowInstance> for WorkflowStateSnapshot {
    fn from(instance: &WorkflowInstance) -> Self {
        let steps = instance
            .execution_order
            .iter()
            .filter_map(|id| instance.step_states.get(id).cloned())
            .collect();
        Self {
            workflow_id: instance.workflow_id.clone(),
            instance_id: instance.id,
            status: instance.status,
            inputs: instance.inputs.clone(),
            outputs: instance.outputs.clone(),
            variables: instance.variables.clone(),
            steps,
            current_step_id: instance.current_step_id.clone(),
            completed_step_ids: instance.step_ids_with_status(StepStatus::Completed),
            failed_step_ids: instance.step_ids_with_status(StepStatus::Failed),
            skipped_step_ids: instance.step_ids_with_status(StepStatus::Skipped),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Auto,
    Manual,
    StepSuccess,
    WorkflowStart,
    Milestone,
}

/// A timestamped, immutable copy of workflow state usable as a rollback target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub state: WorkflowStateSnapshot,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Optional labels attached at checkpoint creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl CheckpointOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Rollback request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Nothing is undone; the rollback completes immediately.
    SkipAndContinue,
    /// Compensate only the currently failed steps.
    FailedStepOnly,
    /// Restore an explicit checkpoint and compensate steps completed since.
    ToCheckpoint,
    /// As `ToCheckpoint`, against the latest step-success checkpoint.
    ToLastSuccess,
    /// Restore the workflow-start checkpoint and compensate every completed step.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackRequest {
    pub instance_id: Uuid,
    pub strategy: RollbackStrategy,
    pub reason: String,
    pub target_checkpoint_id: Option<Uuid>,
    /// Continue past failed required compensations.
    pub force: bool,
    pub skip_compensation: bool,
    /// Caller's view of the current state. The latest checkpoint is used when absent.
    pub current_state: Option<WorkflowStateSnapshot>,
}

impl RollbackRequest {
    pub fn new(instance_id: Uuid, strategy: RollbackStrategy, reason: impl Into<String>) -> Self {
        Self {
            instance_id,
            strategy,
            reason: reason.into(),
            target_checkpoint_id: None,
            force: false,
            skip_compensation: false,
            current_state: None,
        }
    }

    #[must_use]
    pub fn with_target_checkpoint(mut self, checkpoint_id: Uuid) -> Self {
        self.target_checkpoint_id = Some(checkpoint_id);
        self
    }

    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn with_skip_compensation(mut self, skip: bool) -> Self {
        self.skip_compensation = skip;
        self
    }

    #[must_use]
    pub fn with_current_state(mut self, state: WorkflowStateSnapshot) -> Self {
        self.current_state = Some(state);
        self
    }
}

/// Outcome of one compensation action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensationResult {
    pub step_id: String,
    pub action_name: String,
    pub success: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackResult {
    pub rollback_id: Uuid,
    pub instance_id: Uuid,
    pub strategy: RollbackStrategy,
    pub status: RollbackStatus,
    pub reason: String,
    pub rolled_back_step_ids: Vec<String>,
    pub compensation_results: Vec<CompensationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_state: Option<WorkflowStateSnapshot>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, status: StepStatus) -> StepState {
        StepState {
            step_id: id.to_string(),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_from_instance_buckets_steps() {
        let mut step_states = HashMap::new();
        for s in [
            step("fetch", StepStatus::Completed),
            step("parse", StepStatus::Failed),
            step("notify", StepStatus::Skipped),
            step("store", StepStatus::Completed),
        ] {
            step_states.insert(s.step_id.clone(), s);
        }
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            workflow_id: "ingest".to_string(),
            workflow_name: "Ingest".to_string(),
            workflow_version: "1.0.0".to_string(),
            status: WorkflowStatus::Completed,
            inputs: HashMap::from([("url".to_string(), json!("https://example.com"))]),
            variables: HashMap::new(),
            outputs: HashMap::from([("fetch".to_string(), json!({"bytes": 10}))]),
            step_states,
            execution_order: vec![
                "fetch".to_string(),
                "parse".to_string(),
                "notify".to_string(),
                "store".to_string(),
            ],
            current_step_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let snapshot = WorkflowStateSnapshot::from(&instance);
        assert_eq!(snapshot.instance_id, instance.id);
        assert_eq!(snapshot.completed_step_ids, vec!["fetch", "store"]);
        assert_eq!(snapshot.failed_step_ids, vec!["parse"]);
        assert_eq!(snapshot.skipped_step_ids, vec!["notify"]);
        assert_eq!(snapshot.steps.len(), 4);
        assert_eq!(snapshot.steps[0].step_id, "fetch");
    }

    #[test]
    fn test_checkpoint_serde_roundtrip() {
        let instance_id = Uuid::now_v7();
        let mut state = WorkflowStateSnapshot::new("wf", instance_id);
        state.completed_step_ids.push("a".to_string());
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            instance_id,
            checkpoint_type: CheckpointType::StepSuccess,
            state,
            created_at: Utc::now(),
            name: Some("after-a".to_string()),
            description: None,
            tags: vec!["milestone".to_string()],
            metadata: HashMap::new(),
        };
        let json_str = serde_json::to_string(&checkpoint).unwrap();
        assert!(json_str.contains("\"checkpoint_type\":\"step_success\""));
        let parsed: Checkpoint = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[test]
    fn test_rollback_request_builder() {
        let target = Uuid::now_v7();
        let request = RollbackRequest::new(Uuid::now_v7(), RollbackStrategy::ToCheckpoint, "bad deploy")
            .with_target_checkpoint(target)
            .with_force(true);
        assert_eq!(request.target_checkpoint_id, Some(target));
        assert!(request.force);
        assert!(!request.skip_compensation);
        assert!(request.current_state.is_none());
    }
}
