//! Repository contracts — the driver boundary.
//!
//! One trait per persistent entity, grouped under [`EngineStore`]. The
//! interpreter and managers operate exclusively through these traits;
//! `MemoryStore` backs tests and POC deployments, the `postgres` feature
//! adds a production driver.

use crate::definition::ProcessDefinition;
use crate::error::Result;
use crate::history::{HistoricActivity, HistoricProcessInstance, HistoricTask};
use crate::model::*;
use crate::outbox::{OutboxEvent, OutboxStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait ProcessDefinitionRepo: Send + Sync {
    async fn save(&self, definition: &ProcessDefinition) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>>;
    /// Highest version for the key, if any.
    async fn find_latest_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>>;
}

#[async_trait]
pub trait ProcessInstanceRepo: Send + Sync {
    async fn save(&self, instance: &ProcessInstance) -> Result<()>;
    async fn update(&self, instance: &ProcessInstance) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn find_by_business_key(&self, business_key: &str) -> Result<Vec<ProcessInstance>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    async fn save(&self, execution: &Execution) -> Result<()>;
    async fn update(&self, execution: &Execution) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>>;
    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<Execution>>;
    /// Live (non-completed) executions positioned at an element.
    async fn find_at_element(&self, pid: Uuid, element_id: &str) -> Result<Vec<Execution>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn delete_by_instance(&self, pid: Uuid) -> Result<()>;
}

#[async_trait]
pub trait ScopeRepo: Send + Sync {
    async fn save(&self, scope: &VariableScope) -> Result<()>;
    async fn update(&self, scope: &VariableScope) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<VariableScope>>;
    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<VariableScope>>;
    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<VariableScope>>;
    async fn delete_by_instance(&self, pid: Uuid) -> Result<()>;
}

#[async_trait]
pub trait VariableRepo: Send + Sync {
    /// Insert or overwrite by `(scope_id, name)`.
    async fn upsert(&self, variable: &Variable) -> Result<()>;
    async fn find(&self, scope_id: Uuid, name: &str) -> Result<Option<Variable>>;
    async fn find_by_scope(&self, scope_id: Uuid) -> Result<Vec<Variable>>;
    async fn delete_by_scope(&self, scope_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait EventSubscriptionRepo: Send + Sync {
    async fn save(&self, sub: &EventSubscription) -> Result<()>;
    async fn update(&self, sub: &EventSubscription) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn delete_by_execution(&self, execution_id: Uuid) -> Result<()>;
    async fn delete_by_instance(&self, pid: Uuid) -> Result<()>;
    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<EventSubscription>>;
    /// Instance-level subscriptions matching `(event_type, event_name)` —
    /// broadcast targets for signals, candidates for messages.
    async fn find_by_name_and_type(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>>;
    /// Unique non-compensation key.
    async fn find_by_key(
        &self,
        pid: Uuid,
        activity_id: &str,
        event_type: EventType,
    ) -> Result<Option<EventSubscription>>;
    /// Timer subscriptions due at or before `now`, oldest first.
    async fn find_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventSubscription>>;
    /// Definition-level start-event subscriptions for `(event_type, name)`.
    async fn find_start_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>>;
    /// All definition-level subscriptions registered for one definition.
    async fn find_by_definition(&self, definition_id: Uuid) -> Result<Vec<EventSubscription>>;
}

#[async_trait]
pub trait TransactionScopeRepo: Send + Sync {
    async fn save(&self, tx: &TransactionScope) -> Result<()>;
    async fn update(&self, tx: &TransactionScope) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<TransactionScope>>;
    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<TransactionScope>>;
    /// The scope (active or retired event scope) opened for a variable scope.
    async fn find_by_scope(&self, scope_id: Uuid) -> Result<Option<TransactionScope>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn save(&self, task: &Task) -> Result<()>;
    async fn update(&self, task: &Task) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>>;
    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<Task>>;
    async fn find_by_execution(&self, execution_id: Uuid) -> Result<Vec<Task>>;
}

#[async_trait]
pub trait OutboxRepo: Send + Sync {
    async fn append(&self, event: &OutboxEvent) -> Result<()>;
    async fn update(&self, event: &OutboxEvent) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>>;
    /// Rows in the given status, `create_time ASC`, up to `limit`.
    async fn find_by_status(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxEvent>>;
    /// All rows for an instance in append order (tests, projections).
    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<OutboxEvent>>;
    /// Delete PROCESSED rows older than `cutoff`; returns how many.
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait IncidentRepo: Send + Sync {
    async fn save(&self, incident: &Incident) -> Result<()>;
    async fn update(&self, incident: &Incident) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Incident>>;
    async fn find_open_by_instance(&self, pid: Uuid) -> Result<Vec<Incident>>;
}

#[async_trait]
pub trait HistoryRepo: Send + Sync {
    async fn save_process(&self, record: &HistoricProcessInstance) -> Result<()>;
    async fn save_activity(&self, record: &HistoricActivity) -> Result<()>;
    async fn save_task(&self, record: &HistoricTask) -> Result<()>;
    async fn find_process(&self, pid: Uuid) -> Result<Option<HistoricProcessInstance>>;
    async fn find_activities(&self, pid: Uuid) -> Result<Vec<HistoricActivity>>;
    async fn find_tasks(&self, pid: Uuid) -> Result<Vec<HistoricTask>>;
}

/// Aggregated store handed to the runtime. A driver implements every repo
/// trait and hands out itself.
pub trait EngineStore: Send + Sync {
    fn definitions(&self) -> &dyn ProcessDefinitionRepo;
    fn instances(&self) -> &dyn ProcessInstanceRepo;
    fn executions(&self) -> &dyn ExecutionRepo;
    fn scopes(&self) -> &dyn ScopeRepo;
    fn variables(&self) -> &dyn VariableRepo;
    fn subscriptions(&self) -> &dyn EventSubscriptionRepo;
    fn transactions(&self) -> &dyn TransactionScopeRepo;
    fn tasks(&self) -> &dyn TaskRepo;
    fn outbox(&self) -> &dyn OutboxRepo;
    fn incidents(&self) -> &dyn IncidentRepo;
    fn history(&self) -> &dyn HistoryRepo;
}
