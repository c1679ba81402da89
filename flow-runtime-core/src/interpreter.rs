//! Token-flow interpreter: the cooperative scheduler at the heart of the
//! runtime.
//!
//! At most one worker advances a given process instance at a time — a
//! per-instance async lock serializes work units, and work for other
//! instances discovered mid-drive (signal fan-out) is handed off to their
//! own locks. Each work unit loads state, runs one element behavior,
//! persists, and appends outbox rows. Failures retry with bounded backoff;
//! an exhausted budget marks the execution FAILED and raises an incident.

use crate::clock::Clock;
use crate::compensation::{CompensationInvoker, TransactionManager};
use crate::config::RuntimeConfig;
use crate::definition::{ElementKind, ProcessDefinition};
use crate::error::{EngineError, Result};
use crate::event_subprocess::EventSubProcessExecutor;
use crate::expr;
use crate::handler::{HandlerOutcome, HandlerRegistry, ServiceTaskContext};
use crate::model::*;
use crate::outbox::{LifecycleEventType, OutboxEvent};
use crate::scope::ScopeManager;
use crate::store::EngineStore;
use crate::subscription::SubscriptionRegistry;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ─── Work units ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum WorkAction {
    /// Advance the execution through its current element.
    Continue,
    /// An external stimulus arrived for a subscription.
    Trigger {
        subscription_id: Uuid,
        payload: Option<Value>,
    },
    /// User-task completion with supplied variables.
    CompleteTask {
        task_id: Uuid,
        variables: Map<String, Value>,
    },
    Cancel {
        reason: Option<String>,
    },
    /// Explicit compensation throw against the instance.
    Compensate {
        activity_id: Option<String>,
    },
    /// A timer subscription came due (also used after restart recovery).
    ResumeFromTimer {
        subscription_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub process_instance_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub action: WorkAction,
}

impl WorkItem {
    pub fn advance(pid: Uuid, execution_id: Uuid) -> Self {
        Self {
            process_instance_id: pid,
            execution_id: Some(execution_id),
            action: WorkAction::Continue,
        }
    }
}

// ─── Interpreter ──────────────────────────────────────────────

pub struct Interpreter {
    pub(crate) store: Arc<dyn EngineStore>,
    pub(crate) scopes: Arc<ScopeManager>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) transactions: Arc<TransactionManager>,
    pub(crate) event_subprocesses: Arc<EventSubProcessExecutor>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: RuntimeConfig,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Interpreter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EngineStore>,
        scopes: Arc<ScopeManager>,
        registry: Arc<SubscriptionRegistry>,
        transactions: Arc<TransactionManager>,
        event_subprocesses: Arc<EventSubProcessExecutor>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            scopes,
            registry,
            transactions,
            event_subprocesses,
            handlers,
            clock,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn instance_lock(&self, pid: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(pid).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Process work items for one instance to quiescence, holding the
    /// instance lock throughout. Items for other instances (signal fan-out)
    /// are handed off to their own serialized drives.
    pub fn drive(
        self: &Arc<Self>,
        pid: Uuid,
        items: Vec<WorkItem>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let this = self.clone();
        Box::pin(async move {
            let lock = this.instance_lock(pid).await;
            let _guard = lock.lock().await;

            let mut queue: VecDeque<WorkItem> = items.into();
            while let Some(item) = queue.pop_front() {
                if item.process_instance_id != pid {
                    let that = this.clone();
                    tokio::spawn(async move {
                        let foreign = item.process_instance_id;
                        if let Err(e) = that.drive(foreign, vec![item]).await {
                            tracing::error!(instance = %foreign, error = %e, "handed-off work failed");
                        }
                    });
                    continue;
                }
                let instance = match this.store.instances().find_by_id(pid).await? {
                    Some(instance) => instance,
                    None => continue,
                };
                // Cancelled/suspended instances drop queued work on the floor;
                // the flag was set under this same lock.
                if instance.state.is_terminal() && !matches!(item.action, WorkAction::Compensate { .. })
                {
                    continue;
                }
                if instance.state == InstanceState::Suspended {
                    continue;
                }
                let follow_ups = this.run_with_retry(item).await;
                queue.extend(follow_ups);
            }
            Ok(())
        })
    }

    /// Execute one work unit with bounded-backoff retry. Errors that survive
    /// the budget either route as BPMN errors or raise an incident; this
    /// never bubbles an error to the drive loop.
    async fn run_with_retry(self: &Arc<Self>, item: WorkItem) -> Vec<WorkItem> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.process(&item).await {
                Ok(follow_ups) => return follow_ups,
                Err(err) => {
                    let budget = self.retry_budget(&item, &err).await;
                    if attempt < budget {
                        let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                        tracing::debug!(
                            attempt,
                            budget,
                            error = %err,
                            "work unit failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    if let EngineError::Bpmn { code, message } = &err {
                        match self.route_bpmn_error(&item, code, message).await {
                            Ok(follow_ups) => return follow_ups,
                            Err(route_err) => {
                                self.raise_incident(&item, &route_err, attempt).await;
                                return Vec::new();
                            }
                        }
                    }
                    self.raise_incident(&item, &err, attempt).await;
                    return Vec::new();
                }
            }
        }
    }

    /// Transient store errors use the global budget; anything else retries
    /// only if the element declares a retry policy.
    async fn retry_budget(&self, item: &WorkItem, err: &EngineError) -> u32 {
        if err.is_retryable() {
            return self.config.retry_max_attempts.max(1);
        }
        if matches!(err, EngineError::Bpmn { .. }) {
            return 1;
        }
        if let Some(execution_id) = item.execution_id {
            if let Ok(Some(execution)) = self.store.executions().find_by_id(execution_id).await {
                if let Ok(Some(definition)) = self.definition_for(&execution).await {
                    if let Ok(element) = definition.element(&execution.element_id) {
                        if let Some(policy) = &element.retries {
                            return policy.max_attempts.max(1);
                        }
                    }
                }
            }
        }
        1
    }

    async fn definition_for(&self, execution: &Execution) -> Result<Option<ProcessDefinition>> {
        let instance = self
            .store
            .instances()
            .find_by_id(execution.process_instance_id)
            .await?;
        match instance {
            Some(instance) => self.store.definitions().find_by_id(instance.definition_id).await,
            None => Ok(None),
        }
    }

    pub(crate) async fn load_instance(&self, pid: Uuid) -> Result<ProcessInstance> {
        self.store
            .instances()
            .find_by_id(pid)
            .await?
            .ok_or_else(|| EngineError::not_found("process instance", pid))
    }

    pub(crate) async fn load_definition(&self, instance: &ProcessInstance) -> Result<ProcessDefinition> {
        self.store
            .definitions()
            .find_by_id(instance.definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", instance.definition_id))
    }

    pub(crate) async fn emit(&self, event: OutboxEvent) -> Result<()> {
        self.store.outbox().append(&event).await
    }

    // ─── Work-unit dispatch ───────────────────────────────────

    async fn process(self: &Arc<Self>, item: &WorkItem) -> Result<Vec<WorkItem>> {
        match &item.action {
            WorkAction::Continue => {
                let execution_id = item
                    .execution_id
                    .ok_or_else(|| EngineError::Internal("Continue without execution".into()))?;
                let execution = match self.store.executions().find_by_id(execution_id).await? {
                    Some(execution) => execution,
                    // Already merged away by a join or cancelled: stale item.
                    None => return Ok(Vec::new()),
                };
                if !matches!(
                    execution.state,
                    ExecutionState::Ready | ExecutionState::Running
                ) {
                    return Ok(Vec::new());
                }
                self.execute_continue(execution).await
            }
            WorkAction::Trigger {
                subscription_id,
                payload,
            } => {
                self.deliver_subscription(*subscription_id, payload.clone())
                    .await
            }
            WorkAction::ResumeFromTimer { subscription_id } => {
                self.deliver_subscription(*subscription_id, None).await
            }
            WorkAction::CompleteTask { task_id, variables } => {
                self.complete_task_unit(*task_id, variables.clone()).await
            }
            WorkAction::Cancel { reason } => {
                self.cancel_instance(item.process_instance_id, reason.clone())
                    .await
            }
            WorkAction::Compensate { activity_id } => {
                self.compensate_instance(item.process_instance_id, activity_id.as_deref())
                    .await
            }
        }
    }

    // ─── Subscription delivery ────────────────────────────────

    /// Deliver an external stimulus to the element a subscription points at.
    /// A missing row absorbs duplicate deliveries.
    async fn deliver_subscription(
        self: &Arc<Self>,
        subscription_id: Uuid,
        payload: Option<Value>,
    ) -> Result<Vec<WorkItem>> {
        let sub = match self.registry.find_by_id(subscription_id).await? {
            Some(sub) => sub,
            None => return Ok(Vec::new()),
        };
        let pid = match sub.process_instance_id {
            Some(pid) => pid,
            // Definition-level start subscriptions are fired by the runtime.
            None => return Ok(Vec::new()),
        };
        let instance = self.load_instance(pid).await?;
        if instance.state != InstanceState::Active {
            return Ok(Vec::new());
        }
        let definition = self.load_definition(&instance).await?;
        let element = definition.element(&sub.activity_id)?.clone();

        // Cyclic timers re-arm before the old row is consumed; the upsert
        // keyed on (pid, activity, type) replaces it in one step.
        let mut rearmed = false;
        if let SubscriptionConfig::Timer {
            cycle: Some(cycle), ..
        } = &sub.config
        {
            let more = cycle.remaining.map(|r| r > 0).unwrap_or(true);
            if more {
                self.registry
                    .create(crate::subscription::NewSubscription {
                        process_instance_id: sub.process_instance_id,
                        execution_id: sub.execution_id,
                        activity_id: sub.activity_id.clone(),
                        event_type: sub.event_type,
                        event_name: sub.event_name.clone(),
                        config: SubscriptionConfig::Timer {
                            due: self.clock.now()
                                + chrono::Duration::milliseconds(cycle.interval_ms as i64),
                            cycle: Some(TimerCycle {
                                interval_ms: cycle.interval_ms,
                                remaining: cycle.remaining.map(|r| r - 1),
                            }),
                        },
                    })
                    .await?;
                rearmed = true;
            }
        }
        if !rearmed {
            self.registry.consume(sub.id).await?;
        }

        let now = self.clock.now();
        let receipt = match sub.event_type {
            EventType::Signal => Some(LifecycleEventType::SignalReceived),
            EventType::Message => Some(LifecycleEventType::MessageReceived),
            EventType::Timer => Some(LifecycleEventType::TimerFired),
            _ => None,
        };
        if let Some(event_type) = receipt {
            self.emit(
                OutboxEvent::new(event_type, now)
                    .instance(pid)
                    .activity(sub.activity_id.clone())
                    .payload(serde_json::json!({
                        "event_name": sub.event_name,
                        "payload": payload,
                    })),
            )
            .await?;
        }

        match element.kind {
            // Start event inside an event sub-process.
            ElementKind::StartEvent => {
                self.trigger_event_subprocess(&instance, &definition, &element, &sub, payload)
                    .await
            }
            ElementKind::BoundaryEvent => {
                self.fire_boundary_event(&instance, &definition, &element, &sub)
                    .await
            }
            ElementKind::IntermediateCatchEvent => {
                let execution_id = sub
                    .execution_id
                    .ok_or_else(|| EngineError::Internal("catch subscription without execution".into()))?;
                let mut execution = match self.store.executions().find_by_id(execution_id).await? {
                    Some(execution) => execution,
                    None => return Ok(Vec::new()),
                };
                if let Some(data) = payload {
                    self.scopes
                        .set_variable(execution.scope_id, "eventData", data)
                        .await?;
                }
                execution.state = ExecutionState::Ready;
                self.store.executions().update(&execution).await?;
                let targets: Vec<String> = definition
                    .outgoing_flows(&element)
                    .iter()
                    .map(|f| f.target.clone())
                    .collect();
                let mut follow_ups = self.move_to_targets(&definition, execution, targets).await?;
                follow_ups.extend(self.kick_conditionals(pid).await?);
                Ok(follow_ups)
            }
            // Async service work coming back through its implicit
            // subscription.
            ElementKind::ServiceTask => {
                let execution_id = sub.execution_id.ok_or_else(|| {
                    EngineError::Internal("service subscription without execution".into())
                })?;
                let execution = match self.store.executions().find_by_id(execution_id).await? {
                    Some(execution) => execution,
                    None => return Ok(Vec::new()),
                };
                self.complete_async_service(&definition, execution, &element, payload)
                    .await
            }
            other => Err(EngineError::Internal(format!(
                "subscription points at undeliverable element kind {other:?}"
            ))),
        }
    }

    // ─── User tasks ───────────────────────────────────────────

    async fn complete_task_unit(
        self: &Arc<Self>,
        task_id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<Vec<WorkItem>> {
        let mut task = self
            .store
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.state == TaskState::Completed || task.state == TaskState::Cancelled {
            return Err(EngineError::conflict(format!(
                "task {task_id} is already {:?}",
                task.state
            )));
        }
        let mut execution = self
            .store
            .executions()
            .find_by_id(task.execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", task.execution_id))?;
        let instance = self.load_instance(task.process_instance_id).await?;
        let definition = self.load_definition(&instance).await?;
        let element = definition.element(&task.element_id)?.clone();

        // The execution parked in the task-local scope; supplied variables
        // land in the surrounding scope, then the local scope is destroyed.
        let local_scope = self
            .store
            .scopes()
            .find_by_id(execution.scope_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scope", execution.scope_id))?;
        let surrounding = local_scope.parent_id.unwrap_or(local_scope.id);
        for (name, value) in variables {
            self.scopes.set_variable(surrounding, &name, value).await?;
        }
        self.scopes.destroy_scope(local_scope.id).await?;
        execution.scope_id = surrounding;
        execution.state = ExecutionState::Ready;
        self.store.executions().update(&execution).await?;

        let now = self.clock.now();
        task.state = TaskState::Completed;
        task.complete_time = Some(now);
        self.store.tasks().update(&task).await?;
        self.emit(
            OutboxEvent::new(LifecycleEventType::TaskCompleted, now)
                .instance(task.process_instance_id)
                .execution(execution.id)
                .activity(task.element_id.clone())
                .task(task.id)
                .payload(serde_json::json!({ "name": task.name })),
        )
        .await?;

        self.leave_activity(&definition, &execution, &element).await?;
        let targets: Vec<String> = definition
            .outgoing_flows(&element)
            .iter()
            .map(|f| f.target.clone())
            .collect();
        let mut follow_ups = self
            .move_to_targets(&definition, execution, targets)
            .await?;
        follow_ups.extend(self.kick_conditionals(task.process_instance_id).await?);
        Ok(follow_ups)
    }

    // ─── Cancellation ─────────────────────────────────────────

    async fn cancel_instance(
        &self,
        pid: Uuid,
        reason: Option<String>,
    ) -> Result<Vec<WorkItem>> {
        let mut instance = self.load_instance(pid).await?;
        if instance.state.is_terminal() {
            return Err(EngineError::conflict(format!(
                "instance {pid} is already {:?}",
                instance.state
            )));
        }
        let now = self.clock.now();

        for mut task in self.store.tasks().find_by_instance(pid).await? {
            if matches!(task.state, TaskState::Created | TaskState::Claimed) {
                task.state = TaskState::Cancelled;
                task.complete_time = Some(now);
                self.store.tasks().update(&task).await?;
                self.emit(
                    OutboxEvent::new(LifecycleEventType::TaskCancelled, now)
                        .instance(pid)
                        .task(task.id)
                        .activity(task.element_id.clone()),
                )
                .await?;
            }
        }

        // Compensation subscriptions go with the rest: the instance is gone,
        // nothing can throw against it afterwards.
        self.registry.delete_by_instance(pid).await?;
        for mut tx in self.store.transactions().find_by_instance(pid).await? {
            tx.compensation_subscriptions.clear();
            if !matches!(
                tx.state,
                TransactionState::Cancelled | TransactionState::Completed
            ) {
                tx.state = TransactionState::Cancelled;
                tx.complete_time = Some(now);
            }
            self.store.transactions().update(&tx).await?;
        }
        self.store.executions().delete_by_instance(pid).await?;
        self.scopes.destroy_scope(instance.root_scope_id).await?;

        instance.state = InstanceState::Cancelled;
        instance.end_time = Some(now);
        self.store.instances().update(&instance).await?;
        self.emit(
            OutboxEvent::new(LifecycleEventType::ProcessInstanceCancelled, now)
                .instance(pid)
                .payload(serde_json::json!({ "state": "CANCELLED", "reason": reason })),
        )
        .await?;
        Ok(Vec::new())
    }

    // ─── Explicit compensation ────────────────────────────────

    async fn compensate_instance(
        self: &Arc<Self>,
        pid: Uuid,
        activity_id: Option<&str>,
    ) -> Result<Vec<WorkItem>> {
        let transactions = self.store.transactions().find_by_instance(pid).await?;
        let wanted = activity_id.map(|a| vec![a.to_string()]);
        let mut triggered = 0;
        for tx in transactions.iter().rev() {
            if tx.compensation_subscriptions.is_empty() {
                continue;
            }
            if let Some(wanted) = &wanted {
                let mut holds = false;
                for sub_id in &tx.compensation_subscriptions {
                    if let Some(sub) = self.registry.find_by_id(*sub_id).await? {
                        if wanted.iter().any(|w| *w == sub.activity_id) {
                            holds = true;
                            break;
                        }
                    }
                }
                if !holds {
                    continue;
                }
            }
            triggered += self
                .transactions
                .trigger_compensation(tx.id, wanted.as_deref(), self.as_ref())
                .await?;
        }
        if triggered == 0 && activity_id.is_some() {
            return Err(EngineError::not_found(
                "compensation subscription",
                activity_id.unwrap_or_default(),
            ));
        }
        Ok(Vec::new())
    }

    // ─── Conditional re-evaluation ────────────────────────────

    /// Re-evaluate the instance's conditional subscriptions after variable
    /// writes; a false→true transition fires the subscription.
    pub(crate) async fn kick_conditionals(&self, pid: Uuid) -> Result<Vec<WorkItem>> {
        let mut fired = Vec::new();
        for sub in self.registry.conditionals(pid).await? {
            let (expression, last_value) = match &sub.config {
                SubscriptionConfig::Conditional {
                    expression,
                    last_value,
                } => (expression.clone(), *last_value),
                _ => continue,
            };
            let scope_id = match sub.execution_id {
                Some(execution_id) => {
                    match self.store.executions().find_by_id(execution_id).await? {
                        Some(execution) => execution.scope_id,
                        None => continue,
                    }
                }
                None => continue,
            };
            let vars = self.scopes.get_variables(scope_id).await?;
            let value = expr::evaluate_condition(&expression, &vars, None).unwrap_or(false);
            if value && !last_value {
                fired.push(WorkItem {
                    process_instance_id: pid,
                    execution_id: sub.execution_id,
                    action: WorkAction::Trigger {
                        subscription_id: sub.id,
                        payload: None,
                    },
                });
            } else if value != last_value {
                self.registry.record_conditional_value(&sub, value).await?;
            }
        }
        Ok(fired)
    }

    // ─── Incidents ────────────────────────────────────────────

    async fn raise_incident(&self, item: &WorkItem, err: &EngineError, attempts: u32) {
        let pid = item.process_instance_id;
        tracing::error!(instance = %pid, error = %err, attempts, "work unit exhausted retries");

        let now = self.clock.now();
        let (execution_id, element_id) = match item.execution_id {
            Some(execution_id) => {
                match self.store.executions().find_by_id(execution_id).await {
                    Ok(Some(mut execution)) => {
                        execution.state = ExecutionState::Failed;
                        let _ = self.store.executions().update(&execution).await;
                        (execution.id, execution.element_id)
                    }
                    _ => (execution_id, String::new()),
                }
            }
            None => (Uuid::nil(), String::new()),
        };

        let incident = Incident {
            id: Uuid::now_v7(),
            process_instance_id: pid,
            execution_id,
            element_id: element_id.clone(),
            error_message: err.to_string(),
            retry_count: attempts,
            create_time: now,
            resolve_time: None,
            resolution: None,
        };
        if let Err(e) = self.store.incidents().save(&incident).await {
            tracing::error!(error = %e, "failed to persist incident");
            return;
        }
        let _ = self
            .emit(
                OutboxEvent::new(LifecycleEventType::IncidentRaised, now)
                    .instance(pid)
                    .execution(execution_id)
                    .activity(element_id)
                    .payload(serde_json::json!({
                        "incident_id": incident.id,
                        "error": err.to_string(),
                    })),
            )
            .await;
    }
}

// ─── Compensation handler invocation ──────────────────────────

#[async_trait]
impl CompensationInvoker for Interpreter {
    /// Run one compensation handler synchronously. Only service and script
    /// tasks can act as handlers; anything else fails the replay entry.
    async fn invoke_handler(
        &self,
        process_instance_id: Uuid,
        handler_activity_id: &str,
        compensated_activity_id: &str,
    ) -> Result<()> {
        let instance = self.load_instance(process_instance_id).await?;
        let definition = self.load_definition(&instance).await?;
        let handler = definition.element(handler_activity_id)?;
        let variables = self.scopes.get_variables(instance.root_scope_id).await?;

        match handler.kind {
            ElementKind::ServiceTask => {
                let task_type = handler.task_type.as_deref().unwrap_or_default();
                let service = self.handlers.get(task_type).ok_or_else(|| {
                    EngineError::CompensationHandlerFailed {
                        activity_id: compensated_activity_id.to_string(),
                        detail: format!("no handler registered for `{task_type}`"),
                    }
                })?;
                let mut bindings = variables;
                bindings.insert(
                    "compensatedActivityId".to_string(),
                    Value::String(compensated_activity_id.to_string()),
                );
                let outcome = service
                    .execute(ServiceTaskContext {
                        process_instance_id,
                        execution_id: Uuid::nil(),
                        element_id: handler_activity_id.to_string(),
                        variables: bindings,
                    })
                    .await?;
                match outcome {
                    HandlerOutcome::Complete(writes) => {
                        for (name, value) in writes {
                            self.scopes
                                .set_variable(instance.root_scope_id, &name, value)
                                .await?;
                        }
                        Ok(())
                    }
                    HandlerOutcome::Async => Err(EngineError::CompensationHandlerFailed {
                        activity_id: compensated_activity_id.to_string(),
                        detail: "compensation handlers must complete synchronously".into(),
                    }),
                    HandlerOutcome::Error { code, message } => {
                        Err(EngineError::CompensationHandlerFailed {
                            activity_id: compensated_activity_id.to_string(),
                            detail: format!("{code}: {message}"),
                        })
                    }
                }
            }
            ElementKind::ScriptTask => {
                let script = handler.script.as_deref().unwrap_or_default();
                let result = expr::evaluate(script, &variables, None)?;
                if let Some(result_variable) = &handler.result_variable {
                    self.scopes
                        .set_variable(instance.root_scope_id, result_variable, result)
                        .await?;
                }
                Ok(())
            }
            other => Err(EngineError::CompensationHandlerFailed {
                activity_id: compensated_activity_id.to_string(),
                detail: format!("element kind {other:?} cannot act as a compensation handler"),
            }),
        }
    }
}
