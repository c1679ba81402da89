//! Service-task handlers. Handlers are registered by task type at runtime
//! construction (an explicit registry, no runtime discovery) and invoked by
//! the interpreter inside the work unit that executes the element.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What the interpreter hands a handler: correlation ids plus the merged
/// variable view of the executing scope.
#[derive(Debug, Clone)]
pub struct ServiceTaskContext {
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub element_id: String,
    pub variables: Map<String, Value>,
}

/// Handler verdict.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Work done; the map is applied as variable writes to the task's scope.
    Complete(Map<String, Value>),
    /// Work continues out of process; the execution parks WAITING until
    /// `ProcessRuntime::complete_async_work` delivers the result.
    Async,
    /// Business failure expressed as a BPMN error, routed to the nearest
    /// catching boundary or event sub-process.
    Error { code: String, message: String },
}

#[async_trait]
pub trait ServiceTaskHandler: Send + Sync {
    async fn execute(&self, ctx: ServiceTaskContext) -> Result<HandlerOutcome>;
}

/// Task-type → handler map, assembled once before the runtime starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ServiceTaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn ServiceTaskHandler>,
    ) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn ServiceTaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Convenience adapter: wrap a closure as a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ServiceTaskHandler for FnHandler<F>
where
    F: Fn(ServiceTaskContext) -> Result<HandlerOutcome> + Send + Sync,
{
    async fn execute(&self, ctx: ServiceTaskContext) -> Result<HandlerOutcome> {
        (self.0)(ctx)
    }
}
