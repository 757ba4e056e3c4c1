//! Fluent construction of workflow definitions.
//!
//! Step constructors append a step; the modifiers (`depends_on`, `retry`,
//! `on_error`, `when`, `timeout_ms`) apply to the most recently added step.

use std::collections::HashMap;

use serde_json::Value;
use taskflow_types::workflow::{
    Condition, ErrorPolicy, RetryPolicy, StepDefinition, TransformMapping, WorkflowDefinition,
};

use super::definition::{WorkflowError, validate_definition};

/// Builder for [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            definition: WorkflowDefinition::new(id, name),
        }
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.definition.version = version.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn workflow_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.definition.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.definition.metadata.insert(key.into(), value);
        self
    }

    // -- step constructors --

    #[must_use]
    pub fn agent(
        self,
        id: impl Into<String>,
        agent_type: impl Into<String>,
        task_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        self.step(StepDefinition::agent(id, agent_type, task_type, payload))
    }

    #[must_use]
    pub fn parallel(self, id: impl Into<String>, steps: Vec<StepDefinition>, fail_fast: bool) -> Self {
        self.step(StepDefinition::parallel(id, steps, fail_fast))
    }

    #[must_use]
    pub fn condition(
        self,
        id: impl Into<String>,
        predicate: Condition,
        then_steps: Vec<StepDefinition>,
        else_steps: Vec<StepDefinition>,
    ) -> Self {
        self.step(StepDefinition::branch(id, predicate, then_steps, else_steps))
    }

    #[must_use]
    pub fn for_each(
        self,
        id: impl Into<String>,
        items: impl Into<String>,
        steps: Vec<StepDefinition>,
        max_iterations: Option<u32>,
    ) -> Self {
        let step = StepDefinition::for_each(id, items, steps);
        let step = match max_iterations {
            Some(max) => step.with_max_iterations(max),
            None => step,
        };
        self.step(step)
    }

    #[must_use]
    pub fn wait(self, id: impl Into<String>, duration_ms: u64) -> Self {
        self.step(StepDefinition::wait(id, duration_ms))
    }

    #[must_use]
    pub fn transform(self, id: impl Into<String>, mappings: Vec<TransformMapping>) -> Self {
        self.step(StepDefinition::transform(id, mappings))
    }

    /// Append a fully constructed step.
    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.definition.steps.push(step);
        self
    }

    // -- modifiers for the last step --

    #[must_use]
    pub fn depends_on<I, S>(self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.map_last(|step| step.with_depends_on(deps))
    }

    #[must_use]
    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.map_last(|step| step.with_retry(policy))
    }

    #[must_use]
    pub fn on_error(self, policy: ErrorPolicy) -> Self {
        self.map_last(|step| step.with_on_error(policy))
    }

    /// Skip the last step unless `condition` holds.
    #[must_use]
    pub fn when(self, condition: Condition) -> Self {
        self.map_last(|step| step.with_condition(condition))
    }

    #[must_use]
    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        self.map_last(|step| step.with_timeout_ms(timeout_ms))
    }

    fn map_last(mut self, f: impl FnOnce(StepDefinition) -> StepDefinition) -> Self {
        if let Some(last) = self.definition.steps.pop() {
            self.definition.steps.push(f(last));
        }
        self
    }

    /// Validate and return the definition.
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        validate_definition(&self.definition)?;
        Ok(self.definition)
    }

    /// Return the definition without validating it.
    pub fn build_unchecked(self) -> WorkflowDefinition {
        self.definition
    }
}

/// Shorthand for a `HashMap<String, Value>` of workflow inputs.
pub fn inputs<I, K>(pairs: I) -> HashMap<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_types::workflow::{StepKind, StepType};

    #[test]
    fn builds_chained_steps() {
        let def = WorkflowBuilder::new("deploy", "Deploy")
            .version("2.0.0")
            .description("ship it")
            .agent("build", "builder", "compile", json!({ "target": "${inputs.target}" }))
            .retry(RetryPolicy::new(2, 500))
            .timeout_ms(60_000)
            .agent("test", "tester", "run", json!({}))
            .depends_on(["build"])
            .on_error(ErrorPolicy::Continue)
            .wait("cooldown", 1_000)
            .depends_on(["test"])
            .when(Condition::equals("${inputs.env}", json!("prod")))
            .build()
            .unwrap();

        assert_eq!(def.version, "2.0.0");
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[0].retry.as_ref().unwrap().max_attempts, 2);
        assert_eq!(def.steps[0].timeout_ms, Some(60_000));
        assert_eq!(def.steps[1].depends_on, vec!["build"]);
        assert_eq!(def.steps[1].on_error, ErrorPolicy::Continue);
        assert!(def.steps[2].condition.is_some());
        assert_eq!(def.steps[2].step_type(), StepType::Wait);
    }

    #[test]
    fn composite_constructors() {
        let def = WorkflowBuilder::new("wf", "Composite")
            .parallel(
                "fan",
                vec![
                    StepDefinition::agent("x", "a", "t", json!({})),
                    StepDefinition::agent("y", "a", "t", json!({})),
                ],
                true,
            )
            .for_each(
                "each",
                "${inputs.items}",
                vec![StepDefinition::agent("item", "a", "t", json!("${item}"))],
                Some(5),
            )
            .condition(
                "gate",
                Condition::equals("${inputs.ok}", json!(true)),
                vec![StepDefinition::wait("then", 1)],
                vec![],
            )
            .transform("bind", vec![TransformMapping::new("inputs.a", "a")])
            .build()
            .unwrap();

        assert_eq!(def.all_steps().len(), 8);
        match &def.steps[1].kind {
            StepKind::Loop { max_iterations, .. } => assert_eq!(*max_iterations, Some(5)),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn build_validates() {
        let err = WorkflowBuilder::new("wf", "Bad")
            .agent("a", "x", "t", json!({}))
            .depends_on(["missing"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("missing"));

        assert!(WorkflowBuilder::new("wf", "Empty").build().is_err());
        assert!(WorkflowBuilder::new("wf", "Empty").build_unchecked().steps.is_empty());
    }

    #[test]
    fn modifiers_without_steps_are_ignored() {
        let def = WorkflowBuilder::new("wf", "W")
            .retry(RetryPolicy::default())
            .agent("a", "x", "t", json!({}))
            .build()
            .unwrap();
        assert!(def.steps[0].retry.is_none());
    }

    #[test]
    fn inputs_helper() {
        let map = inputs([("a", json!(1)), ("b", json!("two"))]);
        assert_eq!(map["b"], json!("two"));
    }
}
