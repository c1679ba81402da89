//! In-memory `EngineStore` for tests and POC deployments. All state lives
//! in one `Inner` behind a `tokio::sync::RwLock`; reads clone.

use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::history::{HistoricActivity, HistoricProcessInstance, HistoricTask};
use crate::model::*;
use crate::outbox::{OutboxEvent, OutboxStatus};
use crate::store::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    definitions: HashMap<Uuid, ProcessDefinition>,
    instances: HashMap<Uuid, ProcessInstance>,
    executions: HashMap<Uuid, Execution>,
    scopes: HashMap<Uuid, VariableScope>,
    variables: HashMap<(Uuid, String), Variable>,
    /// Insertion order preserved for deterministic scans.
    subscriptions: Vec<EventSubscription>,
    transactions: HashMap<Uuid, TransactionScope>,
    tasks: HashMap<Uuid, Task>,
    /// Append order is the authoritative per-instance event order.
    outbox: Vec<OutboxEvent>,
    incidents: HashMap<Uuid, Incident>,
    historic_processes: HashMap<Uuid, HistoricProcessInstance>,
    historic_activities: Vec<HistoricActivity>,
    historic_tasks: HashMap<Uuid, HistoricTask>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessDefinitionRepo for MemoryStore {
    async fn save(&self, definition: &ProcessDefinition) -> Result<()> {
        let mut w = self.inner.write().await;
        w.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>> {
        let r = self.inner.read().await;
        Ok(r.definitions.get(&id).cloned())
    }

    async fn find_latest_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>> {
        let r = self.inner.read().await;
        Ok(r.definitions
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned())
    }
}

#[async_trait]
impl ProcessInstanceRepo for MemoryStore {
    async fn save(&self, instance: &ProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &ProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.instances.contains_key(&instance.id) {
            return Err(EngineError::not_found("process instance", instance.id));
        }
        w.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&id).cloned())
    }

    async fn find_by_business_key(&self, business_key: &str) -> Result<Vec<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances
            .values()
            .filter(|i| i.business_key.as_deref() == Some(business_key))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepo for MemoryStore {
    async fn save(&self, execution: &Execution) -> Result<()> {
        let mut w = self.inner.write().await;
        w.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &Execution) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.executions.contains_key(&execution.id) {
            return Err(EngineError::not_found("execution", execution.id));
        }
        w.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>> {
        let r = self.inner.read().await;
        Ok(r.executions.get(&id).cloned())
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<Execution>> {
        let r = self.inner.read().await;
        let mut executions: Vec<Execution> = r
            .executions
            .values()
            .filter(|e| e.process_instance_id == pid)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.id);
        Ok(executions)
    }

    async fn find_at_element(&self, pid: Uuid, element_id: &str) -> Result<Vec<Execution>> {
        let r = self.inner.read().await;
        let mut executions: Vec<Execution> = r
            .executions
            .values()
            .filter(|e| {
                e.process_instance_id == pid
                    && e.element_id == element_id
                    && e.state != ExecutionState::Completed
            })
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.id);
        Ok(executions)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.executions.remove(&id);
        Ok(())
    }

    async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.executions.retain(|_, e| e.process_instance_id != pid);
        Ok(())
    }
}

#[async_trait]
impl ScopeRepo for MemoryStore {
    async fn save(&self, scope: &VariableScope) -> Result<()> {
        let mut w = self.inner.write().await;
        w.scopes.insert(scope.id, scope.clone());
        Ok(())
    }

    async fn update(&self, scope: &VariableScope) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.scopes.contains_key(&scope.id) {
            return Err(EngineError::not_found("scope", scope.id));
        }
        w.scopes.insert(scope.id, scope.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VariableScope>> {
        let r = self.inner.read().await;
        Ok(r.scopes.get(&id).cloned())
    }

    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<VariableScope>> {
        let r = self.inner.read().await;
        let mut children: Vec<VariableScope> = r
            .scopes
            .values()
            .filter(|s| s.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|s| s.id);
        Ok(children)
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<VariableScope>> {
        let r = self.inner.read().await;
        let mut scopes: Vec<VariableScope> = r
            .scopes
            .values()
            .filter(|s| s.process_instance_id == pid)
            .cloned()
            .collect();
        scopes.sort_by_key(|s| s.id);
        Ok(scopes)
    }

    async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        let doomed: Vec<Uuid> = w
            .scopes
            .values()
            .filter(|s| s.process_instance_id == pid)
            .map(|s| s.id)
            .collect();
        w.scopes.retain(|_, s| s.process_instance_id != pid);
        w.variables.retain(|(scope_id, _), _| !doomed.contains(scope_id));
        Ok(())
    }
}

#[async_trait]
impl VariableRepo for MemoryStore {
    async fn upsert(&self, variable: &Variable) -> Result<()> {
        let mut w = self.inner.write().await;
        w.variables.insert(
            (variable.scope_id, variable.name.clone()),
            variable.clone(),
        );
        Ok(())
    }

    async fn find(&self, scope_id: Uuid, name: &str) -> Result<Option<Variable>> {
        let r = self.inner.read().await;
        Ok(r.variables.get(&(scope_id, name.to_string())).cloned())
    }

    async fn find_by_scope(&self, scope_id: Uuid) -> Result<Vec<Variable>> {
        let r = self.inner.read().await;
        let mut vars: Vec<Variable> = r
            .variables
            .values()
            .filter(|v| v.scope_id == scope_id)
            .cloned()
            .collect();
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vars)
    }

    async fn delete_by_scope(&self, scope_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.variables.retain(|(sid, _), _| *sid != scope_id);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriptionRepo for MemoryStore {
    async fn save(&self, sub: &EventSubscription) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subscriptions.push(sub.clone());
        Ok(())
    }

    async fn update(&self, sub: &EventSubscription) -> Result<()> {
        let mut w = self.inner.write().await;
        match w.subscriptions.iter_mut().find(|s| s.id == sub.id) {
            Some(slot) => {
                *slot = sub.clone();
                Ok(())
            }
            None => Err(EngineError::not_found("event subscription", sub.id)),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subscriptions.retain(|s| s.id != id);
        Ok(())
    }

    async fn delete_by_execution(&self, execution_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subscriptions
            .retain(|s| s.execution_id != Some(execution_id));
        Ok(())
    }

    async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subscriptions
            .retain(|s| s.process_instance_id != Some(pid));
        Ok(())
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<EventSubscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .filter(|s| s.process_instance_id == Some(pid))
            .cloned()
            .collect())
    }

    async fn find_by_name_and_type(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .filter(|s| {
                s.process_instance_id.is_some()
                    && s.event_type == event_type
                    && s.event_name.as_deref() == Some(event_name)
            })
            .cloned()
            .collect())
    }

    async fn find_by_key(
        &self,
        pid: Uuid,
        activity_id: &str,
        event_type: EventType,
    ) -> Result<Option<EventSubscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .find(|s| {
                s.process_instance_id == Some(pid)
                    && s.activity_id == activity_id
                    && s.event_type == event_type
            })
            .cloned())
    }

    async fn find_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventSubscription>> {
        let r = self.inner.read().await;
        let mut due: Vec<EventSubscription> = r
            .subscriptions
            .iter()
            .filter(|s| {
                s.event_type == EventType::Timer
                    && s.due_time().map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.due_time());
        due.truncate(limit);
        Ok(due)
    }

    async fn find_start_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .filter(|s| {
                s.process_instance_id.is_none()
                    && s.event_type == event_type
                    && s.event_name.as_deref() == Some(event_name)
            })
            .cloned()
            .collect())
    }

    async fn find_by_definition(&self, definition_id: Uuid) -> Result<Vec<EventSubscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .iter()
            .filter(|s| match &s.config {
                SubscriptionConfig::StartEvent { definition_id: d } => *d == definition_id,
                SubscriptionConfig::TimerStart { definition_id: d, .. } => *d == definition_id,
                _ => false,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionScopeRepo for MemoryStore {
    async fn save(&self, tx: &TransactionScope) -> Result<()> {
        let mut w = self.inner.write().await;
        w.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update(&self, tx: &TransactionScope) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.transactions.contains_key(&tx.id) {
            return Err(EngineError::not_found("transaction scope", tx.id));
        }
        w.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TransactionScope>> {
        let r = self.inner.read().await;
        Ok(r.transactions.get(&id).cloned())
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<TransactionScope>> {
        let r = self.inner.read().await;
        let mut txs: Vec<TransactionScope> = r
            .transactions
            .values()
            .filter(|t| t.process_instance_id == pid)
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.id);
        Ok(txs)
    }

    async fn find_by_scope(&self, scope_id: Uuid) -> Result<Option<TransactionScope>> {
        let r = self.inner.read().await;
        Ok(r.transactions
            .values()
            .find(|t| t.scope_id == scope_id)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.transactions.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl TaskRepo for MemoryStore {
    async fn save(&self, task: &Task) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.tasks.contains_key(&task.id) {
            return Err(EngineError::not_found("task", task.id));
        }
        w.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks.get(&id).cloned())
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<Task> = r
            .tasks
            .values()
            .filter(|t| t.process_instance_id == pid)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn find_by_execution(&self, execution_id: Uuid) -> Result<Vec<Task>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<Task> = r
            .tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}

#[async_trait]
impl OutboxRepo for MemoryStore {
    async fn append(&self, event: &OutboxEvent) -> Result<()> {
        let mut w = self.inner.write().await;
        w.outbox.push(event.clone());
        Ok(())
    }

    async fn update(&self, event: &OutboxEvent) -> Result<()> {
        let mut w = self.inner.write().await;
        match w.outbox.iter_mut().find(|e| e.id == event.id) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(EngineError::not_found("outbox event", event.id)),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let r = self.inner.read().await;
        Ok(r.outbox.iter().find(|e| e.id == id).cloned())
    }

    async fn find_by_status(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxEvent>> {
        let r = self.inner.read().await;
        Ok(r.outbox
            .iter()
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<OutboxEvent>> {
        let r = self.inner.read().await;
        Ok(r.outbox
            .iter()
            .filter(|e| e.process_instance_id == Some(pid))
            .cloned()
            .collect())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut w = self.inner.write().await;
        let before = w.outbox.len();
        w.outbox.retain(|e| {
            !(e.status == OutboxStatus::Processed
                && e.processed_time.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok(before - w.outbox.len())
    }
}

#[async_trait]
impl IncidentRepo for MemoryStore {
    async fn save(&self, incident: &Incident) -> Result<()> {
        let mut w = self.inner.write().await;
        w.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn update(&self, incident: &Incident) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.incidents.contains_key(&incident.id) {
            return Err(EngineError::not_found("incident", incident.id));
        }
        w.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Incident>> {
        let r = self.inner.read().await;
        Ok(r.incidents.get(&id).cloned())
    }

    async fn find_open_by_instance(&self, pid: Uuid) -> Result<Vec<Incident>> {
        let r = self.inner.read().await;
        let mut incidents: Vec<Incident> = r
            .incidents
            .values()
            .filter(|i| i.process_instance_id == pid && i.resolve_time.is_none())
            .cloned()
            .collect();
        incidents.sort_by_key(|i| i.id);
        Ok(incidents)
    }
}

#[async_trait]
impl HistoryRepo for MemoryStore {
    async fn save_process(&self, record: &HistoricProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.historic_processes
            .insert(record.process_instance_id, record.clone());
        Ok(())
    }

    async fn save_activity(&self, record: &HistoricActivity) -> Result<()> {
        let mut w = self.inner.write().await;
        match w.historic_activities.iter_mut().find(|a| a.id == record.id) {
            Some(slot) => *slot = record.clone(),
            None => w.historic_activities.push(record.clone()),
        }
        Ok(())
    }

    async fn save_task(&self, record: &HistoricTask) -> Result<()> {
        let mut w = self.inner.write().await;
        w.historic_tasks.insert(record.task_id, record.clone());
        Ok(())
    }

    async fn find_process(&self, pid: Uuid) -> Result<Option<HistoricProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.historic_processes.get(&pid).cloned())
    }

    async fn find_activities(&self, pid: Uuid) -> Result<Vec<HistoricActivity>> {
        let r = self.inner.read().await;
        Ok(r.historic_activities
            .iter()
            .filter(|a| a.process_instance_id == pid)
            .cloned()
            .collect())
    }

    async fn find_tasks(&self, pid: Uuid) -> Result<Vec<HistoricTask>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<HistoricTask> = r
            .historic_tasks
            .values()
            .filter(|t| t.process_instance_id == pid)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.task_id);
        Ok(tasks)
    }
}

impl EngineStore for MemoryStore {
    fn definitions(&self) -> &dyn ProcessDefinitionRepo {
        self
    }
    fn instances(&self) -> &dyn ProcessInstanceRepo {
        self
    }
    fn executions(&self) -> &dyn ExecutionRepo {
        self
    }
    fn scopes(&self) -> &dyn ScopeRepo {
        self
    }
    fn variables(&self) -> &dyn VariableRepo {
        self
    }
    fn subscriptions(&self) -> &dyn EventSubscriptionRepo {
        self
    }
    fn transactions(&self) -> &dyn TransactionScopeRepo {
        self
    }
    fn tasks(&self) -> &dyn TaskRepo {
        self
    }
    fn outbox(&self) -> &dyn OutboxRepo {
        self
    }
    fn incidents(&self) -> &dyn IncidentRepo {
        self
    }
    fn history(&self) -> &dyn HistoryRepo {
        self
    }
}
