//! Workflow definition parsing and validation.
//!
//! Converts YAML or JSON documents into the canonical `WorkflowDefinition`
//! and validates structural constraints (unique step IDs across the whole
//! step tree, sibling-scoped dependencies, sane retry policies).
//!
//! Acyclicity is not checked here: a cyclic graph is a runtime failure of
//! the instance, reported by the DAG planner.

use std::collections::HashSet;
use std::path::Path;

use taskflow_types::workflow::{StepDefinition, StepKind, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading, validating, or planning a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("circular dependency: {0}")]
    CycleDetected(String),

    /// A step references a dependency that is not a sibling.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Template or condition could not be resolved.
    #[error("expression error: {0}")]
    ExpressionError(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a workflow file. `.json` files are parsed as JSON, anything else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - ID and name are non-empty
/// - At least one step exists
/// - Step IDs are non-empty and unique across the whole step tree
/// - `depends_on` references name sibling steps in the same step list
/// - Retry policies allow at least one attempt with a multiplier >= 1
/// - Timeouts are > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }
    if def.timeout_ms == Some(0) {
        return Err(WorkflowError::ValidationError(
            "workflow timeout must be > 0".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in def.all_steps() {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        validate_step(step)?;
    }

    validate_siblings(&def.steps)
}

fn validate_step(step: &StepDefinition) -> Result<(), WorkflowError> {
    if let Some(retry) = &step.retry {
        if retry.max_attempts < 1 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': retry max_attempts must be >= 1",
                step.id
            )));
        }
        if retry.backoff_multiplier < 1.0 || !retry.backoff_multiplier.is_finite() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': retry backoff_multiplier must be >= 1",
                step.id
            )));
        }
    }
    if step.timeout_ms == Some(0) {
        return Err(WorkflowError::ValidationError(format!(
            "step '{}': timeout must be > 0",
            step.id
        )));
    }

    match &step.kind {
        StepKind::Agent { agent_type, .. } if agent_type.trim().is_empty() => {
            Err(WorkflowError::ValidationError(format!(
                "agent step '{}' has an empty agent_type",
                step.id
            )))
        }
        StepKind::Transform { mappings } => {
            match mappings.iter().find(|m| m.target.trim().is_empty()) {
                Some(_) => Err(WorkflowError::ValidationError(format!(
                    "transform step '{}' has a mapping with an empty target",
                    step.id
                ))),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

/// `depends_on` is scoped to the enclosing step list.
fn validate_siblings(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
        match &step.kind {
            StepKind::Parallel { steps, .. } | StepKind::Loop { steps, .. } => {
                validate_siblings(steps)?;
            }
            StepKind::Condition {
                then_steps,
                else_steps,
                ..
            } => {
                validate_siblings(then_steps)?;
                validate_siblings(else_steps)?;
            }
            StepKind::Agent { .. } | StepKind::Wait { .. } | StepKind::Transform { .. } => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
