//! `ProcessRuntime` — the facade external adapters call. Wires the
//! interpreter, managers, outbox publisher, and history projector over one
//! store/bus/clock, and owns the background loops (outbox drain, failed-row
//! retry, janitor, timer poll).

use crate::bus::{EventBus, InMemoryBus};
use crate::clock::{Clock, SystemClock};
use crate::compensation::TransactionManager;
use crate::config::RuntimeConfig;
use crate::definition::{EventDefinition, ProcessDefinition};
use crate::error::{EngineError, Result};
use crate::event_subprocess::EventSubProcessExecutor;
use crate::handler::{HandlerRegistry, ServiceTaskHandler};
use crate::history::HistoryProjector;
use crate::interpreter::{Interpreter, WorkAction, WorkItem};
use crate::model::*;
use crate::outbox::{LifecycleEventType, OutboxEvent, OutboxPublisher};
use crate::scope::ScopeManager;
use crate::store::EngineStore;
use crate::subscription::{NewSubscription, SubscriptionRegistry};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct ProcessRuntime {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
    scopes: Arc<ScopeManager>,
    registry: Arc<SubscriptionRegistry>,
    interpreter: Arc<Interpreter>,
    publisher: Arc<OutboxPublisher>,
}

pub struct ProcessRuntimeBuilder {
    store: Arc<dyn EngineStore>,
    bus: Option<Arc<dyn EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<RuntimeConfig>,
    handlers: HandlerRegistry,
    with_history: bool,
}

impl ProcessRuntimeBuilder {
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn handler(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn ServiceTaskHandler>,
    ) -> Self {
        self.handlers.register(task_type, handler);
        self
    }

    /// Disable the built-in history projector (external projections only).
    pub fn without_history(mut self) -> Self {
        self.with_history = false;
        self
    }

    pub async fn build(self) -> Arc<ProcessRuntime> {
        let store = self.store;
        let bus = self.bus.unwrap_or_else(|| Arc::new(InMemoryBus::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config.unwrap_or_default();

        let scopes = Arc::new(ScopeManager::new(store.clone(), clock.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(store.clone(), clock.clone()));
        let transactions = Arc::new(TransactionManager::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let event_subprocesses = Arc::new(EventSubProcessExecutor::new(
            store.clone(),
            registry.clone(),
            scopes.clone(),
            clock.clone(),
        ));
        let interpreter = Arc::new(Interpreter::new(
            store.clone(),
            scopes.clone(),
            registry.clone(),
            transactions,
            event_subprocesses,
            Arc::new(self.handlers),
            clock.clone(),
            config.clone(),
        ));
        let publisher = Arc::new(OutboxPublisher::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            config.clone(),
        ));

        if self.with_history {
            bus.subscribe(
                "*",
                Arc::new(HistoryProjector::new(store.clone(), clock.clone())),
            )
            .await;
        }

        Arc::new(ProcessRuntime {
            store,
            clock,
            config,
            scopes,
            registry,
            interpreter,
            publisher,
        })
    }
}

impl ProcessRuntime {
    pub fn builder(store: Arc<dyn EngineStore>) -> ProcessRuntimeBuilder {
        ProcessRuntimeBuilder {
            store,
            bus: None,
            clock: None,
            config: None,
            handlers: HandlerRegistry::new(),
            with_history: true,
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<OutboxPublisher> {
        &self.publisher
    }

    // ─── Deployment ───────────────────────────────────────────

    /// Deploy a validated definition: assign the next version for its key
    /// and (re)register its signal/message/timer start-event subscriptions.
    pub async fn deploy(&self, mut definition: ProcessDefinition) -> Result<ProcessDefinition> {
        let prior = self
            .store
            .definitions()
            .find_latest_by_key(&definition.key)
            .await?;
        if let Some(prior) = &prior {
            definition.version = prior.version + 1;
            // The new version takes over event-based starts.
            for sub in self.store.subscriptions().find_by_definition(prior.id).await? {
                self.store.subscriptions().delete(sub.id).await?;
            }
        }
        self.store.definitions().save(&definition).await?;

        for start in definition.start_events(None) {
            let (event_type, event_name, config) = match &start.event {
                Some(EventDefinition::Signal { signal_ref }) => (
                    EventType::Signal,
                    Some(signal_ref.clone()),
                    SubscriptionConfig::StartEvent {
                        definition_id: definition.id,
                    },
                ),
                Some(EventDefinition::Message { message_ref }) => (
                    EventType::Message,
                    Some(message_ref.clone()),
                    SubscriptionConfig::StartEvent {
                        definition_id: definition.id,
                    },
                ),
                Some(EventDefinition::Timer { timer }) => {
                    let cycle = match timer {
                        crate::definition::TimerSpec::Cycle {
                            interval_ms,
                            repetitions,
                        } => Some(TimerCycle {
                            interval_ms: *interval_ms,
                            remaining: repetitions.map(|r| r.saturating_sub(1)),
                        }),
                        _ => None,
                    };
                    (
                        EventType::Timer,
                        None,
                        SubscriptionConfig::TimerStart {
                            definition_id: definition.id,
                            due: timer.due_from(self.clock.now()),
                            cycle,
                        },
                    )
                }
                _ => continue,
            };
            self.registry
                .create(NewSubscription {
                    process_instance_id: None,
                    execution_id: None,
                    activity_id: start.id.clone(),
                    event_type,
                    event_name,
                    config,
                })
                .await?;
        }

        tracing::info!(
            key = %definition.key,
            version = definition.version,
            "process definition deployed"
        );
        Ok(definition)
    }

    // ─── Instance start ───────────────────────────────────────

    pub async fn start_process_by_key(
        &self,
        key: &str,
        business_key: Option<String>,
        variables: Map<String, Value>,
        tenant_id: Option<String>,
    ) -> Result<Uuid> {
        let definition = self
            .store
            .definitions()
            .find_latest_by_key(key)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", key))?;
        self.start_with(&definition, business_key, variables, tenant_id, None)
            .await
    }

    pub async fn start_process(
        &self,
        definition_id: Uuid,
        business_key: Option<String>,
        variables: Map<String, Value>,
        tenant_id: Option<String>,
    ) -> Result<Uuid> {
        let definition = self
            .store
            .definitions()
            .find_by_id(definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", definition_id))?;
        self.start_with(&definition, business_key, variables, tenant_id, None)
            .await
    }

    /// Create the instance, its root scope and start tokens, then drive it
    /// to quiescence. `entry_point` narrows startup to one specific start
    /// event (event-based starts); otherwise every plain start event fires.
    async fn start_with(
        &self,
        definition: &ProcessDefinition,
        business_key: Option<String>,
        variables: Map<String, Value>,
        tenant_id: Option<String>,
        entry_point: Option<&str>,
    ) -> Result<Uuid> {
        let starts: Vec<_> = definition
            .start_events(None)
            .into_iter()
            .filter(|s| match entry_point {
                Some(id) => s.id == id,
                None => s.event.is_none(),
            })
            .map(|s| s.id.clone())
            .collect();
        if starts.is_empty() {
            return Err(EngineError::conflict(format!(
                "definition `{}` has no startable start event",
                definition.key
            )));
        }

        let pid = Uuid::now_v7();
        let now = self.clock.now();
        let root_scope_id = self
            .scopes
            .create_scope(pid, None, ScopeKind::Process, None)
            .await?;
        let instance = ProcessInstance {
            id: pid,
            definition_id: definition.id,
            business_key: business_key.clone(),
            tenant_id,
            state: InstanceState::Active,
            start_time: now,
            end_time: None,
            root_scope_id,
        };
        self.store.instances().save(&instance).await?;
        self.store
            .outbox()
            .append(
                &OutboxEvent::new(LifecycleEventType::ProcessInstanceStart, now)
                    .instance(pid)
                    .payload(serde_json::json!({
                        "definition_id": definition.id,
                        "definition_key": definition.key,
                        "business_key": business_key,
                    })),
            )
            .await?;

        for (name, value) in variables {
            self.scopes.set_variable(root_scope_id, &name, value).await?;
        }

        let mut items = Vec::new();
        let mut first_execution = None;
        for start_id in &starts {
            let execution = Execution::new(pid, None, start_id, root_scope_id);
            self.store.executions().save(&execution).await?;
            first_execution.get_or_insert(execution.id);
            items.push(WorkItem::advance(pid, execution.id));
        }

        if let Some(anchor) = first_execution {
            for esp in definition.event_subprocesses_of(None) {
                self.interpreter
                    .event_subprocesses
                    .register(&crate::event_subprocess::RegisterContext {
                        definition,
                        element: esp,
                        process_instance_id: pid,
                        parent_execution_id: anchor,
                        parent_scope_id: root_scope_id,
                    })
                    .await?;
            }
        }

        self.interpreter.drive(pid, items).await?;
        Ok(pid)
    }

    /// Start new instances from every deployed signal/message start event
    /// matching `(event_type, event_name)`. Returns the started instance
    /// ids (possibly none).
    pub async fn start_by_event(
        &self,
        event_type: EventType,
        event_name: &str,
        payload: Option<Value>,
    ) -> Result<Vec<Uuid>> {
        let mut started = Vec::new();
        for sub in self
            .registry
            .start_subscriptions(event_type, event_name)
            .await?
        {
            if let SubscriptionConfig::StartEvent { definition_id } = sub.config {
                started.push(
                    self.start_for_start_event(definition_id, &sub.activity_id, payload.clone())
                        .await?,
                );
            }
        }
        Ok(started)
    }

    /// Start an instance for a fired signal/message/timer start event.
    async fn start_for_start_event(
        &self,
        definition_id: Uuid,
        start_event_id: &str,
        payload: Option<Value>,
    ) -> Result<Uuid> {
        let definition = self
            .store
            .definitions()
            .find_by_id(definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process definition", definition_id))?;
        let variables = match payload {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("eventData".to_string(), other);
                map
            }
            None => Map::new(),
        };
        self.start_with(&definition, None, variables, None, Some(start_event_id))
            .await
    }

    // ─── External events ──────────────────────────────────────

    /// Broadcast a signal: every matching subscription fires, and matching
    /// signal start events spawn new instances. `pid` narrows delivery to
    /// one instance.
    pub async fn signal(
        &self,
        signal_name: &str,
        payload: Option<Value>,
        pid: Option<Uuid>,
    ) -> Result<()> {
        let targets = self.registry.signal_targets(signal_name, pid).await?;
        let mut by_instance: BTreeMap<Uuid, Vec<WorkItem>> = BTreeMap::new();
        for sub in targets {
            let target_pid = match sub.process_instance_id {
                Some(target_pid) => target_pid,
                None => continue,
            };
            by_instance.entry(target_pid).or_default().push(WorkItem {
                process_instance_id: target_pid,
                execution_id: sub.execution_id,
                action: WorkAction::Trigger {
                    subscription_id: sub.id,
                    payload: payload.clone(),
                },
            });
        }
        for (target_pid, items) in by_instance {
            self.interpreter.drive(target_pid, items).await?;
        }

        if pid.is_none() {
            self.start_by_event(EventType::Signal, signal_name, payload)
                .await?;
        }
        Ok(())
    }

    /// Deliver a message to the single waiting execution it correlates to,
    /// or start an instance from a matching message start event.
    pub async fn deliver_message(
        &self,
        message_name: &str,
        correlation_key: Option<&str>,
        payload: Option<Value>,
    ) -> Result<()> {
        if let Some(sub) = self
            .registry
            .message_target(message_name, correlation_key)
            .await?
        {
            let pid = sub
                .process_instance_id
                .ok_or_else(|| EngineError::Internal("message target without instance".into()))?;
            return self
                .interpreter
                .drive(
                    pid,
                    vec![WorkItem {
                        process_instance_id: pid,
                        execution_id: sub.execution_id,
                        action: WorkAction::Trigger {
                            subscription_id: sub.id,
                            payload,
                        },
                    }],
                )
                .await;
        }
        let started = self
            .start_by_event(EventType::Message, message_name, payload)
            .await?;
        if started.is_empty() {
            return Err(EngineError::not_found("message subscription", message_name));
        }
        Ok(())
    }

    // ─── Tasks ────────────────────────────────────────────────

    pub async fn claim_task(&self, task_id: Uuid, user: &str) -> Result<()> {
        let mut task = self
            .store
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.state != TaskState::Created {
            return Err(EngineError::conflict(format!(
                "task {task_id} cannot be claimed from {:?}",
                task.state
            )));
        }
        task.state = TaskState::Claimed;
        task.assignee = Some(user.to_string());
        self.store.tasks().update(&task).await?;
        self.store
            .outbox()
            .append(
                &OutboxEvent::new(LifecycleEventType::TaskClaimed, self.clock.now())
                    .instance(task.process_instance_id)
                    .task(task.id)
                    .activity(task.element_id.clone())
                    .payload(serde_json::json!({ "assignee": user })),
            )
            .await?;
        Ok(())
    }

    pub async fn complete_task(
        &self,
        task_id: Uuid,
        variables: Option<Map<String, Value>>,
    ) -> Result<()> {
        let task = self
            .store
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if matches!(task.state, TaskState::Completed | TaskState::Cancelled) {
            return Err(EngineError::conflict(format!(
                "task {task_id} is already {:?}",
                task.state
            )));
        }
        self.ensure_active(task.process_instance_id).await?;
        self.interpreter
            .drive(
                task.process_instance_id,
                vec![WorkItem {
                    process_instance_id: task.process_instance_id,
                    execution_id: Some(task.execution_id),
                    action: WorkAction::CompleteTask {
                        task_id,
                        variables: variables.unwrap_or_default(),
                    },
                }],
            )
            .await
    }

    /// Complete an asynchronous service task parked by `HandlerOutcome::Async`.
    pub async fn complete_async_work(
        &self,
        execution_id: Uuid,
        variables: Option<Map<String, Value>>,
    ) -> Result<()> {
        let execution = self
            .store
            .executions()
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))?;
        let pid = execution.process_instance_id;
        let job_name = format!("job:{execution_id}");
        let sub = self
            .registry
            .find_by_instance(pid)
            .await?
            .into_iter()
            .find(|s| s.event_name.as_deref() == Some(job_name.as_str()))
            .ok_or_else(|| EngineError::not_found("async work subscription", execution_id))?;
        self.interpreter
            .drive(
                pid,
                vec![WorkItem {
                    process_instance_id: pid,
                    execution_id: Some(execution_id),
                    action: WorkAction::Trigger {
                        subscription_id: sub.id,
                        payload: Some(Value::Object(variables.unwrap_or_default())),
                    },
                }],
            )
            .await
    }

    // ─── Instance administration ──────────────────────────────

    pub async fn suspend(&self, pid: Uuid) -> Result<()> {
        let mut instance = self.instance(pid).await?;
        if instance.state != InstanceState::Active {
            return Err(EngineError::conflict(format!(
                "instance {pid} cannot suspend from {:?}",
                instance.state
            )));
        }
        instance.state = InstanceState::Suspended;
        self.store.instances().update(&instance).await?;
        self.store
            .outbox()
            .append(
                &OutboxEvent::new(
                    LifecycleEventType::ProcessInstanceSuspended,
                    self.clock.now(),
                )
                .instance(pid),
            )
            .await?;
        Ok(())
    }

    pub async fn resume(&self, pid: Uuid) -> Result<()> {
        let mut instance = self.instance(pid).await?;
        if instance.state != InstanceState::Suspended {
            return Err(EngineError::conflict(format!(
                "instance {pid} cannot resume from {:?}",
                instance.state
            )));
        }
        instance.state = InstanceState::Active;
        self.store.instances().update(&instance).await?;
        self.store
            .outbox()
            .append(
                &OutboxEvent::new(
                    LifecycleEventType::ProcessInstanceResumed,
                    self.clock.now(),
                )
                .instance(pid),
            )
            .await?;

        let items: Vec<WorkItem> = self
            .store
            .executions()
            .find_by_instance(pid)
            .await?
            .into_iter()
            .filter(|e| e.state == ExecutionState::Ready)
            .map(|e| WorkItem::advance(pid, e.id))
            .collect();
        if !items.is_empty() {
            self.interpreter.drive(pid, items).await?;
        }
        Ok(())
    }

    pub async fn cancel(&self, pid: Uuid, reason: Option<String>) -> Result<()> {
        let instance = self.instance(pid).await?;
        if instance.state.is_terminal() {
            return Err(EngineError::conflict(format!(
                "instance {pid} is already {:?}",
                instance.state
            )));
        }
        self.interpreter
            .drive(
                pid,
                vec![WorkItem {
                    process_instance_id: pid,
                    execution_id: None,
                    action: WorkAction::Cancel { reason },
                }],
            )
            .await
    }

    pub async fn trigger_compensation(&self, pid: Uuid, activity_id: Option<String>) -> Result<()> {
        self.instance(pid).await?;
        self.interpreter
            .drive(
                pid,
                vec![WorkItem {
                    process_instance_id: pid,
                    execution_id: None,
                    action: WorkAction::Compensate { activity_id },
                }],
            )
            .await
    }

    pub async fn resolve_incident(&self, incident_id: Uuid, resolution: &str) -> Result<()> {
        let mut incident = self
            .store
            .incidents()
            .find_by_id(incident_id)
            .await?
            .ok_or_else(|| EngineError::not_found("incident", incident_id))?;
        if incident.resolve_time.is_some() {
            return Err(EngineError::conflict(format!(
                "incident {incident_id} is already resolved"
            )));
        }
        incident.resolve_time = Some(self.clock.now());
        incident.resolution = Some(resolution.to_string());
        self.store.incidents().update(&incident).await?;
        self.store
            .outbox()
            .append(
                &OutboxEvent::new(LifecycleEventType::IncidentResolved, self.clock.now())
                    .instance(incident.process_instance_id)
                    .execution(incident.execution_id)
                    .payload(serde_json::json!({ "resolution": resolution })),
            )
            .await?;

        // Put the failed execution back on the belt.
        if let Some(mut execution) = self
            .store
            .executions()
            .find_by_id(incident.execution_id)
            .await?
        {
            execution.state = ExecutionState::Ready;
            self.store.executions().update(&execution).await?;
            self.interpreter
                .drive(
                    incident.process_instance_id,
                    vec![WorkItem::advance(
                        incident.process_instance_id,
                        execution.id,
                    )],
                )
                .await?;
        }
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────

    pub async fn instance(&self, pid: Uuid) -> Result<ProcessInstance> {
        self.store
            .instances()
            .find_by_id(pid)
            .await?
            .ok_or_else(|| EngineError::not_found("process instance", pid))
    }

    pub async fn tasks(&self, pid: Uuid) -> Result<Vec<Task>> {
        self.store.tasks().find_by_instance(pid).await
    }

    pub async fn variables(&self, pid: Uuid) -> Result<Map<String, Value>> {
        let instance = self.instance(pid).await?;
        self.scopes.get_variables(instance.root_scope_id).await
    }

    async fn ensure_active(&self, pid: Uuid) -> Result<()> {
        let instance = self.instance(pid).await?;
        if instance.state != InstanceState::Active {
            return Err(EngineError::conflict(format!(
                "instance {pid} is {:?}",
                instance.state
            )));
        }
        Ok(())
    }

    // ─── Timers ───────────────────────────────────────────────

    /// One timer sweep: fire every due subscription. Called by the poll
    /// loop, and directly by tests (with a manual clock) and at startup for
    /// restart recovery.
    pub async fn poll_timers(&self) -> Result<usize> {
        let due = self
            .registry
            .due_timers(self.clock.now(), self.config.timer_batch_size)
            .await?;
        let mut fired = 0;
        for sub in due {
            match sub.process_instance_id {
                Some(pid) => {
                    self.interpreter
                        .drive(
                            pid,
                            vec![WorkItem {
                                process_instance_id: pid,
                                execution_id: sub.execution_id,
                                action: WorkAction::ResumeFromTimer {
                                    subscription_id: sub.id,
                                },
                            }],
                        )
                        .await?;
                    fired += 1;
                }
                None => {
                    if let SubscriptionConfig::TimerStart {
                        definition_id,
                        cycle,
                        ..
                    } = &sub.config
                    {
                        let definition_id = *definition_id;
                        let cycle = cycle.clone();
                        // Re-arm the cycle before consuming the fired row.
                        if let Some(cycle) = cycle {
                            let more = cycle.remaining.map(|r| r > 0).unwrap_or(true);
                            if more {
                                self.registry
                                    .create(NewSubscription {
                                        process_instance_id: None,
                                        execution_id: None,
                                        activity_id: sub.activity_id.clone(),
                                        event_type: EventType::Timer,
                                        event_name: None,
                                        config: SubscriptionConfig::TimerStart {
                                            definition_id,
                                            due: self.clock.now()
                                                + chrono::Duration::milliseconds(
                                                    cycle.interval_ms as i64,
                                                ),
                                            cycle: Some(TimerCycle {
                                                interval_ms: cycle.interval_ms,
                                                remaining: cycle.remaining.map(|r| r - 1),
                                            }),
                                        },
                                    })
                                    .await?;
                            }
                        }
                        self.registry.consume(sub.id).await?;
                        self.start_for_start_event(definition_id, &sub.activity_id, None)
                            .await?;
                        fired += 1;
                    }
                }
            }
        }
        Ok(fired)
    }

    // ─── Background loops ─────────────────────────────────────

    /// Spawn the outbox publisher, failed-row retry sweep, janitor, and
    /// timer poller. Returns the shutdown sender and the join handles.
    pub fn spawn_loops(self: &Arc<Self>) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
        let (tx, rx) = watch::channel(false);
        let mut handles = Vec::new();

        let publisher = self.publisher.clone();
        let shutdown = rx.clone();
        handles.push(tokio::spawn(async move {
            publisher.run(shutdown).await;
        }));

        let publisher = self.publisher.clone();
        let shutdown = rx.clone();
        handles.push(tokio::spawn(async move {
            publisher.run_retry_loop(shutdown).await;
        }));

        let publisher = self.publisher.clone();
        let shutdown = rx.clone();
        handles.push(tokio::spawn(async move {
            publisher.run_janitor(shutdown).await;
        }));

        let runtime = self.clone();
        let mut shutdown = rx;
        handles.push(tokio::spawn(async move {
            tracing::info!("timer poller started");
            loop {
                if *shutdown.borrow() {
                    tracing::info!("timer poller shutting down");
                    break;
                }
                match runtime.poll_timers().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(fired = n, "timers fired"),
                    Err(e) => tracing::error!(error = %e, "timer poll failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(runtime.config.timer_poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }));

        (tx, handles)
    }
}
