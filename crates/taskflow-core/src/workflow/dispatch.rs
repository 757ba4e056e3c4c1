//! Agent dispatch port.
//!
//! The engine never performs a step's work itself: AGENT steps hand a
//! resolved payload to an `AgentDispatcher` supplied by the host and map
//! the boolean outcome to COMPLETED or FAILED.
//!
//! Follows the same blanket-impl pattern as the engine's other ports:
//! 1. `AgentDispatcher` uses RPITIT for implementors
//! 2. `AgentDispatcherDyn` is the object-safe twin with boxed futures
//! 3. `BoxAgentDispatcher` wraps `Arc<dyn AgentDispatcherDyn>` for storage

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A resolved unit of work for an external agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    pub agent_type: String,
    pub task_type: String,
    /// Payload with every template already resolved.
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What the agent reported back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Transport-level failure: the agent could not be reached at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("no agent available for type '{0}'")]
    NoAgent(String),

    #[error("{0}")]
    Failed(String),
}

/// Host-supplied capability that runs AGENT step payloads.
pub trait AgentDispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        task: AgentTask,
    ) -> impl Future<Output = Result<AgentOutcome, DispatchError>> + Send;
}

/// Object-safe version of [`AgentDispatcher`] with boxed futures.
pub trait AgentDispatcherDyn: Send + Sync {
    fn dispatch_boxed(
        &self,
        task: AgentTask,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutcome, DispatchError>> + Send + '_>>;
}

impl<T: AgentDispatcher> AgentDispatcherDyn for T {
    fn dispatch_boxed(
        &self,
        task: AgentTask,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutcome, DispatchError>> + Send + '_>> {
        Box::pin(self.dispatch(task))
    }
}

/// Type-erased, cheaply cloneable dispatcher.
#[derive(Clone)]
pub struct BoxAgentDispatcher {
    inner: Arc<dyn AgentDispatcherDyn>,
}

impl BoxAgentDispatcher {
    pub fn new<T: AgentDispatcher>(dispatcher: T) -> Self {
        Self {
            inner: Arc::new(dispatcher),
        }
    }

    pub async fn dispatch(&self, task: AgentTask) -> Result<AgentOutcome, DispatchError> {
        self.inner.dispatch_boxed(task).await
    }
}

impl std::fmt::Debug for BoxAgentDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentDispatcher").finish_non_exhaustive()
    }
}
