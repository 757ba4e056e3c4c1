//! Dependency graph construction, cycle detection, and wave computation.
//!
//! Uses `petgraph` to model `depends_on` edges within one step list.
//! Topological sort detects cycles, and depth-based grouping produces
//! execution waves: every step in a wave has all its dependencies in
//! earlier waves, so a wave's steps can run concurrently.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use taskflow_types::workflow::{StepDefinition, StepKind};

use super::definition::WorkflowError;

type StepGraph<'a> = DiGraph<&'a str, ()>;

/// Build a graph with an edge from each dependency to its dependent.
fn build_graph(steps: &[StepDefinition]) -> Result<(StepGraph<'_>, Vec<NodeIndex>), WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = StepGraph::new();
    let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
        }
    }
    Ok((graph, nodes))
}

fn sort(graph: &StepGraph<'_>) -> Result<Vec<NodeIndex>, WorkflowError> {
    toposort(graph, None).map_err(|cycle| {
        WorkflowError::CycleDetected(format!(
            "step '{}' is part of a dependency cycle",
            graph[cycle.node_id()]
        ))
    })
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Group `steps` into execution waves.
///
/// 1. Build a `DiGraph` with step IDs as nodes and `depends_on` edges.
/// 2. Run `petgraph::algo::toposort` to verify acyclicity.
/// 3. Compute each node's depth (max dependency depth + 1).
/// 4. Group steps by depth, preserving declaration order within a wave.
pub fn build_execution_plan(
    steps: &[StepDefinition],
) -> Result<Vec<Vec<&StepDefinition>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let (graph, _) = build_graph(steps)?;
    let sorted = sort(&graph)?;

    let by_id: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node in sorted {
        let step_id = graph[node];
        let depth = by_id[step_id]
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }
    Ok(waves)
}

/// Validate that `steps` and every nested step list (parallel group,
/// condition branch, loop body) form a DAG with no dangling references.
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    let (graph, _) = build_graph(steps)?;
    sort(&graph)?;
    for step in steps {
        match &step.kind {
            StepKind::Parallel { steps, .. } | StepKind::Loop { steps, .. } => validate_dag(steps)?,
            StepKind::Condition {
                then_steps,
                else_steps,
                ..
            } => {
                validate_dag(then_steps)?;
                validate_dag(else_steps)?;
            }
            StepKind::Agent { .. } | StepKind::Wait { .. } | StepKind::Transform { .. } => {}
        }
    }
    Ok(())
}

/// Transitive closure of `step_id`'s dependencies, sorted by ID.
///
/// Returns an empty vec for an unknown step.
pub fn get_step_dependencies<'a>(step_id: &str, steps: &'a [StepDefinition]) -> Vec<&'a str> {
    let by_id: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack: Vec<&str> = vec![step_id];
    while let Some(current) = stack.pop() {
        if let Some(step) = by_id.get(current) {
            for dep in &step.depends_on {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    let mut deps: Vec<&str> = visited.into_iter().collect();
    deps.sort_unstable();
    deps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
