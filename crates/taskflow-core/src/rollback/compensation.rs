//! Compensation actions: the undo operations run for rolled-back steps.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskflow_types::rollback::{RollbackStrategy, WorkflowStateSnapshot};
use uuid::Uuid;

use super::RollbackError;

/// What a compensation handler is told about the rollback invoking it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationContext {
    pub rollback_id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub strategy: RollbackStrategy,
    pub reason: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The state being rolled back from.
    pub state: Option<WorkflowStateSnapshot>,
}

pub type CompensationHandler =
    Arc<dyn Fn(CompensationContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Per-action retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRetry {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for CompensationRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }
}

/// Undo operation registered for one step.
#[derive(Clone)]
pub struct CompensationAction {
    pub step_id: String,
    pub name: String,
    pub handler: CompensationHandler,
    /// Higher priorities run first.
    pub priority: i32,
    /// A failed required action aborts the rollback unless forced.
    pub required: bool,
    pub retry: CompensationRetry,
    pub metadata: HashMap<String, Value>,
}

impl CompensationAction {
    /// A non-required action with priority 0 and a single attempt.
    pub fn new<F, Fut>(step_id: impl Into<String>, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CompensationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
            priority: 0,
            required: false,
            retry: CompensationRetry::default(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = CompensationRetry {
            max_attempts: max_attempts.max(1),
            delay_ms,
        };
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), RollbackError> {
        if self.step_id.trim().is_empty() {
            return Err(RollbackError::InvalidCompensation(
                "compensation step ID must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompensationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationAction")
            .field("step_id", &self.step_id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("required", &self.required)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> CompensationContext {
        CompensationContext {
            rollback_id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            step_id: "charge".to_string(),
            strategy: RollbackStrategy::Full,
            reason: "test".to_string(),
            attempt: 1,
            state: None,
        }
    }

    #[tokio::test]
    async fn handler_receives_context() {
        let action = CompensationAction::new("charge", "refund", |ctx: CompensationContext| async move {
            Ok(json!({ "refunded": ctx.step_id }))
        })
        .with_priority(10)
        .required(true)
        .with_retry(0, 50);

        assert_eq!(action.retry.max_attempts, 1);
        assert_eq!(action.priority, 10);
        assert!(action.required);
        let output = (action.handler)(context()).await.unwrap();
        assert_eq!(output, json!({ "refunded": "charge" }));
    }

    #[test]
    fn empty_step_id_is_rejected() {
        let action = CompensationAction::new("  ", "noop", |_| async { Ok(Value::Null) });
        let err = action.validate().unwrap_err();
        assert!(matches!(err, RollbackError::InvalidCompensation(_)));
    }

    #[test]
    fn debug_omits_handler() {
        let action = CompensationAction::new("s", "undo", |_| async { Ok(Value::Null) });
        let rendered = format!("{action:?}");
        assert!(rendered.contains("undo"));
        assert!(!rendered.contains("handler"));
    }
}
