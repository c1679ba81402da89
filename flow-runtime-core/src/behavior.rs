//! Element behaviors: one function per `ElementKind`, dispatched from a
//! single match, all returning an [`Outcome`] the scheduler applies to the
//! token. Side effects (subscriptions, tasks, scopes, outbox rows) happen
//! inside the behavior; the outcome only says where the token goes next.

use crate::definition::{Element, ElementKind, EventDefinition, ProcessDefinition, TimerSpec};
use crate::error::{EngineError, Result};
use crate::event_subprocess::{TriggerContext, TriggerEvent};
use crate::expr;
use crate::handler::{HandlerOutcome, ServiceTaskContext};
use crate::interpreter::{Interpreter, WorkItem};
use crate::model::*;
use crate::outbox::{LifecycleEventType, OutboxEvent};
use crate::subscription::NewSubscription;
use chrono::DateTime;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What a behavior tells the scheduler about the token it ran.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Move on to these elements; the first reuses the execution, the rest
    /// fork sibling executions.
    LeaveTo(Vec<String>),
    /// Parked; subscriptions (or children) were written by the behavior.
    Wait,
    /// Arrived at a join barrier that is still short of tokens.
    Join,
    /// The token was consumed by an inline path (cancel end event).
    Consumed,
    /// The token reached the end of its scope.
    CompleteScope,
    /// Terminate end event: kill every sibling in the enclosing scope.
    Terminate,
    /// Behavior-level failure (BPMN errors use this; infrastructure errors
    /// return `Err` and go through the retry budget).
    Fail(EngineError),
}

impl Interpreter {
    // ─── Continue: run one element behavior ───────────────────

    pub(crate) async fn execute_continue(
        self: &Arc<Self>,
        mut execution: Execution,
    ) -> Result<Vec<WorkItem>> {
        let instance = self.load_instance(execution.process_instance_id).await?;
        let definition = self.load_definition(&instance).await?;
        let element = definition.element(&execution.element_id)?.clone();

        execution.state = ExecutionState::Running;
        self.store.executions().update(&execution).await?;

        let mut spawned = Vec::new();
        let outcome = self
            .execute_element(&instance, &definition, &mut execution, &element, &mut spawned)
            .await?;
        let mut follow_ups = self
            .apply_outcome(&definition, execution, &element, outcome)
            .await?;
        follow_ups.extend(spawned);
        Ok(follow_ups)
    }

    async fn execute_element(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
        spawned: &mut Vec<WorkItem>,
    ) -> Result<Outcome> {
        match element.kind {
            ElementKind::StartEvent => Ok(Outcome::LeaveTo(flow_targets(definition, element))),
            ElementKind::EndEvent => {
                self.end_event(instance, definition, execution, element, spawned)
                    .await
            }
            ElementKind::IntermediateThrowEvent => {
                self.throw_event(instance, definition, execution, element, spawned)
                    .await
            }
            ElementKind::IntermediateCatchEvent => {
                self.catch_event(execution, element).await
            }
            // The token only sits on a boundary event after its subscription
            // fired; all that is left is leaving through its flows.
            ElementKind::BoundaryEvent => Ok(Outcome::LeaveTo(flow_targets(definition, element))),
            ElementKind::ExclusiveGateway => {
                self.exclusive_gateway(definition, execution, element).await
            }
            ElementKind::ParallelGateway => {
                self.parallel_gateway(definition, execution, element).await
            }
            ElementKind::InclusiveGateway => {
                self.inclusive_gateway(definition, execution, element).await
            }
            ElementKind::UserTask => {
                self.user_task(instance, definition, execution, element).await
            }
            ElementKind::ServiceTask => {
                self.service_task(instance, definition, execution, element, spawned)
                    .await
            }
            ElementKind::ScriptTask => {
                self.script_task(instance, definition, execution, element, spawned)
                    .await
            }
            ElementKind::SubProcess | ElementKind::Transaction => {
                self.enter_subprocess(instance, definition, execution, element, spawned)
                    .await
            }
            ElementKind::EventSubProcess => Err(EngineError::Internal(format!(
                "event sub-process `{}` reached via sequence flow",
                element.id
            ))),
        }
    }

    pub(crate) async fn apply_outcome(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        mut execution: Execution,
        element: &Element,
        outcome: Outcome,
    ) -> Result<Vec<WorkItem>> {
        match outcome {
            Outcome::LeaveTo(targets) => {
                self.move_to_targets(definition, execution, targets).await
            }
            Outcome::Wait => {
                execution.state = ExecutionState::Waiting;
                self.store.executions().update(&execution).await?;
                Ok(Vec::new())
            }
            Outcome::Join | Outcome::Consumed => Ok(Vec::new()),
            Outcome::CompleteScope => self.complete_token(definition, execution).await,
            Outcome::Terminate => self.terminate_scope(definition, execution, element).await,
            Outcome::Fail(err) => Err(err),
        }
    }

    // ─── Token movement ───────────────────────────────────────

    /// Move the execution to `targets`. One target continues the same
    /// token; additional targets fork sibling executions in the same scope.
    /// No targets means an implicit end.
    pub(crate) async fn move_to_targets(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        mut execution: Execution,
        targets: Vec<String>,
    ) -> Result<Vec<WorkItem>> {
        if targets.is_empty() {
            return Box::pin(self.complete_token(definition, execution)).await;
        }
        let pid = execution.process_instance_id;
        let mut follow_ups = Vec::new();

        execution.element_id = targets[0].clone();
        execution.state = ExecutionState::Ready;
        self.store.executions().update(&execution).await?;
        follow_ups.push(WorkItem::advance(pid, execution.id));

        for target in &targets[1..] {
            let sibling = Execution::new(pid, execution.parent_id, target, execution.scope_id);
            self.store.executions().save(&sibling).await?;
            follow_ups.push(WorkItem::advance(pid, sibling.id));
        }
        Ok(follow_ups)
    }

    /// The token is done; if it was the last one in its scope, the scope
    /// completes (cascading into sub-process/instance completion).
    pub(crate) async fn complete_token(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        execution: Execution,
    ) -> Result<Vec<WorkItem>> {
        let scope_id = execution.scope_id;
        let pid = execution.process_instance_id;
        self.store.executions().delete(execution.id).await?;
        self.check_scope_completion(definition, pid, scope_id).await
    }

    async fn scope_chain_contains(&self, scope_id: Uuid, ancestor: Uuid) -> Result<bool> {
        let mut cursor = Some(scope_id);
        while let Some(id) = cursor {
            if id == ancestor {
                return Ok(true);
            }
            cursor = match self.store.scopes().find_by_id(id).await? {
                Some(scope) => scope.parent_id,
                None => None,
            };
        }
        Ok(false)
    }

    async fn scope_has_live_executions(&self, pid: Uuid, scope_id: Uuid) -> Result<bool> {
        for execution in self.store.executions().find_by_instance(pid).await? {
            if execution.state == ExecutionState::Completed {
                continue;
            }
            if self.scope_chain_contains(execution.scope_id, scope_id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Called when a token died inside `scope_id`. If the scope has no live
    /// tokens left it completes: instance end for the root, sub-process /
    /// transaction completion for nested scopes, merge-back for event
    /// sub-processes.
    pub(crate) async fn check_scope_completion(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        pid: Uuid,
        scope_id: Uuid,
    ) -> Result<Vec<WorkItem>> {
        if self.scope_has_live_executions(pid, scope_id).await? {
            return Ok(Vec::new());
        }
        let scope = match self.store.scopes().find_by_id(scope_id).await? {
            Some(scope) => scope,
            None => return Ok(Vec::new()),
        };

        match scope.kind {
            ScopeKind::Process => {
                self.complete_instance(pid, InstanceState::Completed).await?;
                Ok(Vec::new())
            }
            ScopeKind::SubProcess | ScopeKind::Transaction => {
                let element_id = scope.element_id.clone().ok_or_else(|| {
                    EngineError::Internal("sub-process scope without element".into())
                })?;
                let element = definition.element(&element_id)?.clone();

                if scope.kind == ScopeKind::Transaction {
                    if let Some(tx) = self.store.transactions().find_by_scope(scope.id).await? {
                        if tx.state == TransactionState::Active {
                            self.transactions.convert_to_event_scope(tx.id).await?;
                        }
                    }
                }
                self.scopes.destroy_scope(scope.id).await?;

                let host = self
                    .store
                    .executions()
                    .find_at_element(pid, &element_id)
                    .await?
                    .into_iter()
                    .find(|e| e.state == ExecutionState::Waiting);
                match host {
                    Some(mut host) => {
                        host.state = ExecutionState::Ready;
                        self.store.executions().update(&host).await?;
                        self.leave_activity(definition, &host, &element).await?;
                        let targets = flow_targets(definition, &element);
                        self.move_to_targets(definition, host, targets).await
                    }
                    None => Ok(Vec::new()),
                }
            }
            ScopeKind::EventSubProcess => {
                self.scopes.destroy_scope(scope.id).await?;
                match scope.parent_id {
                    Some(parent) => {
                        Box::pin(self.check_scope_completion(definition, pid, parent)).await
                    }
                    None => Ok(Vec::new()),
                }
            }
            ScopeKind::Task | ScopeKind::Local => {
                self.scopes.destroy_scope(scope.id).await?;
                match scope.parent_id {
                    Some(parent) => {
                        Box::pin(self.check_scope_completion(definition, pid, parent)).await
                    }
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    pub(crate) async fn complete_instance(
        &self,
        pid: Uuid,
        final_state: InstanceState,
    ) -> Result<()> {
        let mut instance = self.load_instance(pid).await?;
        if instance.state.is_terminal() {
            return Ok(());
        }
        let now = self.clock.now();
        self.registry.delete_by_instance(pid).await?;
        self.scopes.destroy_scope(instance.root_scope_id).await?;
        instance.state = final_state;
        instance.end_time = Some(now);
        self.store.instances().update(&instance).await?;
        self.emit(
            OutboxEvent::new(LifecycleEventType::ProcessInstanceEnd, now)
                .instance(pid)
                .payload(serde_json::json!({
                    "state": serde_json::to_value(final_state)?,
                })),
        )
        .await?;
        Ok(())
    }

    // ─── End events ───────────────────────────────────────────

    async fn end_event(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
        spawned: &mut Vec<WorkItem>,
    ) -> Result<Outcome> {
        match &element.event {
            None => Ok(Outcome::CompleteScope),
            Some(EventDefinition::Terminate) => Ok(Outcome::Terminate),
            Some(EventDefinition::Error { error_ref }) => {
                let code = error_ref.clone().unwrap_or_default();
                self.emit(
                    OutboxEvent::new(LifecycleEventType::ErrorThrown, self.clock.now())
                        .instance(instance.id)
                        .execution(execution.id)
                        .activity(element.id.clone())
                        .payload(serde_json::json!({ "code": code })),
                )
                .await?;
                Ok(Outcome::Fail(EngineError::Bpmn {
                    code,
                    message: format!("error end event `{}`", element.id),
                }))
            }
            Some(EventDefinition::Cancel) => {
                let follow_ups = self.cancel_end_event(instance, definition, execution).await?;
                spawned.extend(follow_ups);
                Ok(Outcome::Consumed)
            }
            Some(EventDefinition::Compensation { activity_id }) => {
                self.throw_compensation(instance, execution, activity_id.as_deref())
                    .await?;
                Ok(Outcome::CompleteScope)
            }
            Some(other) => Err(EngineError::Internal(format!(
                "end event `{}` has unsupported definition {other:?}",
                element.id
            ))),
        }
    }

    /// Cancel end event: cancel the enclosing transaction (compensating),
    /// kill the remaining tokens inside it, and reroute the host through
    /// its cancel boundary event.
    async fn cancel_end_event(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &Execution,
    ) -> Result<Vec<WorkItem>> {
        let tx_scope = self
            .scopes
            .chain(execution.scope_id)
            .await?
            .into_iter()
            .find(|s| s.kind == ScopeKind::Transaction)
            .ok_or_else(|| {
                EngineError::conflict("cancel end event outside a transaction scope")
            })?;
        let tx = self
            .store
            .transactions()
            .find_by_scope(tx_scope.id)
            .await?
            .ok_or_else(|| EngineError::not_found("transaction scope", tx_scope.id))?;

        // 1. Compensate completed activities (LIFO) and clear subscriptions.
        self.transactions.cancel(tx.id, true, self.as_ref()).await?;

        // 2. Kill the remaining tokens inside the transaction.
        self.store.executions().delete(execution.id).await?;
        for other in self.store.executions().find_by_instance(instance.id).await? {
            if self
                .scope_chain_contains(other.scope_id, tx_scope.id)
                .await?
            {
                Box::pin(self.cancel_execution(definition, other)).await?;
            }
        }
        self.scopes.destroy_scope(tx_scope.id).await?;

        // 3. Reroute the host through the cancel boundary event, if any.
        let tx_element = definition.element(&tx.element_id)?.clone();
        let host = self
            .store
            .executions()
            .find_at_element(instance.id, &tx.element_id)
            .await?
            .into_iter()
            .find(|e| e.state == ExecutionState::Waiting);
        let mut host = match host {
            Some(host) => host,
            None => return Ok(Vec::new()),
        };
        self.registry.delete_by_execution(host.id).await?;
        self.emit(
            OutboxEvent::new(LifecycleEventType::ActivityCancelled, self.clock.now())
                .instance(instance.id)
                .execution(host.id)
                .activity(tx_element.id.clone()),
        )
        .await?;

        let cancel_boundary = definition
            .boundary_events_of(&tx_element.id)
            .into_iter()
            .find(|b| matches!(b.event, Some(EventDefinition::Cancel)))
            .map(|b| b.id.clone());
        let targets = match cancel_boundary {
            Some(boundary_id) => vec![boundary_id],
            None => {
                tracing::warn!(
                    transaction = %tx_element.id,
                    "transaction cancelled without a cancel boundary event"
                );
                flow_targets(definition, &tx_element)
            }
        };
        host.state = ExecutionState::Ready;
        self.store.executions().update(&host).await?;
        self.move_to_targets(definition, host, targets).await
    }

    // ─── Throw events ─────────────────────────────────────────

    async fn throw_event(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
        spawned: &mut Vec<WorkItem>,
    ) -> Result<Outcome> {
        match &element.event {
            None => Ok(Outcome::LeaveTo(flow_targets(definition, element))),
            Some(EventDefinition::Compensation { activity_id }) => {
                self.throw_compensation(instance, execution, activity_id.as_deref())
                    .await?;
                Ok(Outcome::LeaveTo(flow_targets(definition, element)))
            }
            Some(EventDefinition::Signal { signal_ref }) => {
                for sub in self.registry.signal_targets(signal_ref, None).await? {
                    if let Some(pid) = sub.process_instance_id {
                        spawned.push(WorkItem {
                            process_instance_id: pid,
                            execution_id: sub.execution_id,
                            action: crate::interpreter::WorkAction::Trigger {
                                subscription_id: sub.id,
                                payload: None,
                            },
                        });
                    }
                }
                Ok(Outcome::LeaveTo(flow_targets(definition, element)))
            }
            Some(other) => Err(EngineError::Internal(format!(
                "throw event `{}` has unsupported definition {other:?}",
                element.id
            ))),
        }
    }

    /// Compensation throw: replay handlers of the nearest enclosing
    /// transaction scope still holding subscriptions, or — thrown from
    /// outside any transaction — of the instance's retired event scopes.
    async fn throw_compensation(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        execution: &Execution,
        activity_id: Option<&str>,
    ) -> Result<()> {
        let wanted = activity_id.map(|a| vec![a.to_string()]);
        let enclosing = {
            let mut found = None;
            for scope in self.scopes.chain(execution.scope_id).await? {
                if scope.kind == ScopeKind::Transaction {
                    if let Some(tx) = self.store.transactions().find_by_scope(scope.id).await? {
                        found = Some(tx);
                        break;
                    }
                }
            }
            found
        };
        match enclosing {
            Some(tx) => {
                self.transactions
                    .trigger_compensation(tx.id, wanted.as_deref(), self.as_ref())
                    .await?;
            }
            None => {
                for tx in self
                    .store
                    .transactions()
                    .find_by_instance(instance.id)
                    .await?
                    .iter()
                    .rev()
                {
                    if tx.compensation_subscriptions.is_empty() {
                        continue;
                    }
                    self.transactions
                        .trigger_compensation(tx.id, wanted.as_deref(), self.as_ref())
                        .await?;
                }
            }
        }
        Ok(())
    }

    // ─── Catch events ─────────────────────────────────────────

    async fn catch_event(&self, execution: &mut Execution, element: &Element) -> Result<Outcome> {
        let event = element.event.as_ref().ok_or_else(|| {
            EngineError::Definition(format!(
                "catch event `{}` carries no event definition",
                element.id
            ))
        })?;
        let created = self
            .subscribe_for_event(
                execution.process_instance_id,
                Some(execution.id),
                &element.id,
                event,
            )
            .await?;
        if created.is_none() {
            return Err(EngineError::Definition(format!(
                "catch event `{}` has an unsubscribable definition",
                element.id
            )));
        }
        Ok(Outcome::Wait)
    }

    /// Translate an event definition into a subscription row. Returns `None`
    /// for definitions that have no registry representation (terminate,
    /// cancel, compensation attachments).
    pub(crate) async fn subscribe_for_event(
        &self,
        pid: Uuid,
        execution_id: Option<Uuid>,
        activity_id: &str,
        event: &EventDefinition,
    ) -> Result<Option<Uuid>> {
        let (event_type, event_name, config) = match event {
            EventDefinition::Signal { signal_ref } => (
                EventType::Signal,
                Some(signal_ref.clone()),
                SubscriptionConfig::None,
            ),
            EventDefinition::Message { message_ref } => (
                EventType::Message,
                Some(message_ref.clone()),
                SubscriptionConfig::None,
            ),
            EventDefinition::Timer { timer } => {
                let cycle = match timer {
                    TimerSpec::Cycle {
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
                    SubscriptionConfig::Timer {
                        due: timer.due_from(self.clock.now()),
                        cycle,
                    },
                )
            }
            EventDefinition::Conditional { condition } => (
                EventType::Conditional,
                None,
                SubscriptionConfig::Conditional {
                    expression: condition.clone(),
                    last_value: false,
                },
            ),
            EventDefinition::Error { error_ref } => (
                EventType::Error,
                error_ref.clone(),
                SubscriptionConfig::None,
            ),
            _ => return Ok(None),
        };
        let sub = self
            .registry
            .create(NewSubscription {
                process_instance_id: Some(pid),
                execution_id,
                activity_id: activity_id.to_string(),
                event_type,
                event_name,
                config,
            })
            .await?;
        Ok(Some(sub.id))
    }

    // ─── Gateways ─────────────────────────────────────────────

    async fn exclusive_gateway(
        &self,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
    ) -> Result<Outcome> {
        let vars = self.scopes.get_variables(execution.scope_id).await?;
        for flow in definition.outgoing_flows(element) {
            if element.default_flow.as_deref() == Some(flow.id.as_str()) {
                continue;
            }
            let taken = match &flow.condition {
                Some(condition) => expr::evaluate_condition(condition, &vars, None)?,
                None => true,
            };
            if taken {
                return Ok(Outcome::LeaveTo(vec![flow.target.clone()]));
            }
        }
        if let Some(default_flow) = &element.default_flow {
            let flow = definition.flow(default_flow)?;
            return Ok(Outcome::LeaveTo(vec![flow.target.clone()]));
        }
        Err(EngineError::Internal(format!(
            "exclusive gateway `{}` has no outgoing flow to take",
            element.id
        )))
    }

    async fn parallel_gateway(
        &self,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
    ) -> Result<Outcome> {
        if element.incoming.len() > 1 {
            let expected = element.incoming.len();
            if !self.join_arrived(execution, element, expected).await? {
                return Ok(Outcome::Join);
            }
        }
        Ok(Outcome::LeaveTo(flow_targets(definition, element)))
    }

    async fn inclusive_gateway(
        &self,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
    ) -> Result<Outcome> {
        if element.incoming.len() > 1 {
            // Wait until no other live token could still arrive, judged by
            // the deploy-time reachability cache.
            execution.state = ExecutionState::Waiting;
            self.store.executions().update(execution).await?;

            let pid = execution.process_instance_id;
            let waiting_here: Vec<Execution> = self
                .store
                .executions()
                .find_at_element(pid, &element.id)
                .await?
                .into_iter()
                .filter(|e| e.scope_id == execution.scope_id)
                .collect();
            let waiting_ids: Vec<Uuid> = waiting_here.iter().map(|e| e.id).collect();
            for other in self.store.executions().find_by_instance(pid).await? {
                if other.state == ExecutionState::Completed || waiting_ids.contains(&other.id) {
                    continue;
                }
                if definition.reaches(&other.element_id, &element.id) {
                    return Ok(Outcome::Join);
                }
            }
            for stale in waiting_here {
                if stale.id != execution.id {
                    self.store.executions().delete(stale.id).await?;
                }
            }
        }

        let vars = self.scopes.get_variables(execution.scope_id).await?;
        let mut targets = Vec::new();
        for flow in definition.outgoing_flows(element) {
            if element.default_flow.as_deref() == Some(flow.id.as_str()) {
                continue;
            }
            let taken = match &flow.condition {
                Some(condition) => expr::evaluate_condition(condition, &vars, None)?,
                None => true,
            };
            if taken {
                targets.push(flow.target.clone());
            }
        }
        if targets.is_empty() {
            if let Some(default_flow) = &element.default_flow {
                targets.push(definition.flow(default_flow)?.target.clone());
            }
        }
        if targets.is_empty() && !element.outgoing.is_empty() {
            return Err(EngineError::Internal(format!(
                "inclusive gateway `{}` has no outgoing flow to take",
                element.id
            )));
        }
        Ok(Outcome::LeaveTo(targets))
    }

    /// Park the token at the join and report whether the barrier is full.
    /// When it is, the waiting siblings are merged into this execution.
    async fn join_arrived(
        &self,
        execution: &mut Execution,
        element: &Element,
        expected: usize,
    ) -> Result<bool> {
        execution.state = ExecutionState::Waiting;
        self.store.executions().update(execution).await?;

        let waiting: Vec<Execution> = self
            .store
            .executions()
            .find_at_element(execution.process_instance_id, &element.id)
            .await?
            .into_iter()
            .filter(|e| e.scope_id == execution.scope_id && e.state == ExecutionState::Waiting)
            .collect();
        if waiting.len() < expected {
            return Ok(false);
        }
        for merged in waiting {
            if merged.id != execution.id {
                self.store.executions().delete(merged.id).await?;
            }
        }
        Ok(true)
    }

    // ─── Tasks ────────────────────────────────────────────────

    async fn user_task(
        &self,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
    ) -> Result<Outcome> {
        self.enter_activity(definition, execution, element).await?;

        // Task-local scope: task variables live here and die with the task.
        let local_scope = self
            .scopes
            .create_scope(
                instance.id,
                Some(execution.scope_id),
                ScopeKind::Task,
                Some(&element.id),
            )
            .await?;
        execution.scope_id = local_scope;
        self.store.executions().update(execution).await?;

        let due_date = match &element.due_date {
            Some(expression) => {
                let vars = self.scopes.get_variables(local_scope).await?;
                match expr::evaluate(expression, &vars, None)? {
                    Value::String(s) => DateTime::parse_from_rfc3339(&s)
                        .ok()
                        .map(|d| d.with_timezone(&chrono::Utc)),
                    _ => None,
                }
            }
            None => None,
        };

        let now = self.clock.now();
        let task = Task {
            id: Uuid::now_v7(),
            process_instance_id: instance.id,
            execution_id: execution.id,
            element_id: element.id.clone(),
            name: element.name.clone(),
            assignee: element.assignee.clone(),
            candidate_groups: element.candidate_groups.clone(),
            due_date,
            state: TaskState::Created,
            create_time: now,
            complete_time: None,
        };
        self.store.tasks().save(&task).await?;
        self.emit(
            OutboxEvent::new(LifecycleEventType::TaskCreated, now)
                .instance(instance.id)
                .execution(execution.id)
                .activity(element.id.clone())
                .task(task.id)
                .payload(serde_json::json!({
                    "name": task.name,
                    "assignee": task.assignee,
                })),
        )
        .await?;

        // The waiting invariant: the parked execution holds an open
        // subscription keyed to its task.
        self.registry
            .create(NewSubscription {
                process_instance_id: Some(instance.id),
                execution_id: Some(execution.id),
                activity_id: element.id.clone(),
                event_type: EventType::Message,
                event_name: Some(format!("task:{}", task.id)),
                config: SubscriptionConfig::None,
            })
            .await?;
        Ok(Outcome::Wait)
    }

    async fn service_task(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
        spawned: &mut Vec<WorkItem>,
    ) -> Result<Outcome> {
        self.enter_activity(definition, execution, element).await?;

        let task_type = element.task_type.as_deref().unwrap_or_default();
        let handler = self.handlers.get(task_type).ok_or_else(|| {
            EngineError::Internal(format!("no handler registered for task type `{task_type}`"))
        })?;
        let variables = self.scopes.get_variables(execution.scope_id).await?;
        let outcome = handler
            .execute(ServiceTaskContext {
                process_instance_id: instance.id,
                execution_id: execution.id,
                element_id: element.id.clone(),
                variables,
            })
            .await?;

        match outcome {
            HandlerOutcome::Complete(writes) => {
                for (name, value) in writes {
                    self.scopes
                        .set_variable(execution.scope_id, &name, value)
                        .await?;
                }
                self.leave_activity(definition, execution, element).await?;
                spawned.extend(self.kick_conditionals(instance.id).await?);
                Ok(Outcome::LeaveTo(flow_targets(definition, element)))
            }
            HandlerOutcome::Async => {
                // Implicit subscription; resolved by complete_async_work.
                self.registry
                    .create(NewSubscription {
                        process_instance_id: Some(instance.id),
                        execution_id: Some(execution.id),
                        activity_id: element.id.clone(),
                        event_type: EventType::Message,
                        event_name: Some(format!("job:{}", execution.id)),
                        config: SubscriptionConfig::None,
                    })
                    .await?;
                Ok(Outcome::Wait)
            }
            HandlerOutcome::Error { code, message } => {
                self.emit(
                    OutboxEvent::new(LifecycleEventType::ErrorThrown, self.clock.now())
                        .instance(instance.id)
                        .execution(execution.id)
                        .activity(element.id.clone())
                        .payload(serde_json::json!({ "code": code, "message": message })),
                )
                .await?;
                Ok(Outcome::Fail(EngineError::Bpmn { code, message }))
            }
        }
    }

    async fn script_task(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
        spawned: &mut Vec<WorkItem>,
    ) -> Result<Outcome> {
        self.enter_activity(definition, execution, element).await?;
        let script = element.script.as_deref().ok_or_else(|| {
            EngineError::Definition(format!("script task `{}` has no script", element.id))
        })?;
        let vars = self.scopes.get_variables(execution.scope_id).await?;
        let result = expr::evaluate(script, &vars, None)?;
        if let Some(result_variable) = &element.result_variable {
            self.scopes
                .set_variable(execution.scope_id, result_variable, result)
                .await?;
        }
        self.leave_activity(definition, execution, element).await?;
        spawned.extend(self.kick_conditionals(instance.id).await?);
        Ok(Outcome::LeaveTo(flow_targets(definition, element)))
    }

    /// Service-task async completion, delivered through the implicit
    /// subscription.
    pub(crate) async fn complete_async_service(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        mut execution: Execution,
        element: &Element,
        payload: Option<Value>,
    ) -> Result<Vec<WorkItem>> {
        let pid = execution.process_instance_id;
        if let Some(Value::Object(writes)) = payload {
            for (name, value) in writes {
                self.scopes
                    .set_variable(execution.scope_id, &name, value)
                    .await?;
            }
        }
        execution.state = ExecutionState::Ready;
        self.store.executions().update(&execution).await?;
        self.leave_activity(definition, &execution, element).await?;
        let targets = flow_targets(definition, element);
        let mut follow_ups = self.move_to_targets(definition, execution, targets).await?;
        follow_ups.extend(self.kick_conditionals(pid).await?);
        Ok(follow_ups)
    }

    // ─── Sub-processes ────────────────────────────────────────

    async fn enter_subprocess(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        execution: &mut Execution,
        element: &Element,
        spawned: &mut Vec<WorkItem>,
    ) -> Result<Outcome> {
        self.enter_activity(definition, execution, element).await?;

        let kind = if element.kind == ElementKind::Transaction {
            ScopeKind::Transaction
        } else {
            ScopeKind::SubProcess
        };
        let child_scope = self
            .scopes
            .create_scope(instance.id, Some(execution.scope_id), kind, Some(&element.id))
            .await?;

        if element.kind == ElementKind::Transaction {
            self.transactions
                .open(instance.id, Some(execution.id), child_scope, &element.id)
                .await?;
        }

        for esp in definition.event_subprocesses_of(Some(&element.id)) {
            self.event_subprocesses
                .register(&crate::event_subprocess::RegisterContext {
                    definition,
                    element: esp,
                    process_instance_id: instance.id,
                    parent_execution_id: execution.id,
                    parent_scope_id: child_scope,
                })
                .await?;
        }

        let mut entered = false;
        for start in definition.start_events(Some(&element.id)) {
            if start.event.is_some() {
                continue;
            }
            let child = Execution::new(instance.id, Some(execution.id), &start.id, child_scope);
            self.store.executions().save(&child).await?;
            spawned.push(WorkItem::advance(instance.id, child.id));
            entered = true;
        }
        if !entered {
            return Err(EngineError::Definition(format!(
                "sub-process `{}` has no plain start event",
                element.id
            )));
        }
        Ok(Outcome::Wait)
    }

    // ─── Activity bookkeeping ─────────────────────────────────

    /// Activity entry: start event row plus boundary-event subscriptions.
    pub(crate) async fn enter_activity(
        &self,
        definition: &ProcessDefinition,
        execution: &Execution,
        element: &Element,
    ) -> Result<()> {
        if element.kind.is_activity() {
            self.emit(
                OutboxEvent::new(LifecycleEventType::ActivityStarted, self.clock.now())
                    .instance(execution.process_instance_id)
                    .execution(execution.id)
                    .activity(element.id.clone()),
            )
            .await?;
        }
        for boundary in definition.boundary_events_of(&element.id) {
            if let Some(event) = &boundary.event {
                self.subscribe_for_event(
                    execution.process_instance_id,
                    Some(execution.id),
                    &boundary.id,
                    event,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Activity exit: drop boundary subscriptions, register the
    /// compensation handler with the enclosing transaction, emit completion.
    pub(crate) async fn leave_activity(
        &self,
        _definition: &ProcessDefinition,
        execution: &Execution,
        element: &Element,
    ) -> Result<()> {
        self.registry.delete_by_execution(execution.id).await?;

        if let Some(handler) = &element.compensation_handler {
            for scope in self.scopes.chain(execution.scope_id).await? {
                if scope.kind != ScopeKind::Transaction {
                    continue;
                }
                if let Some(tx) = self.store.transactions().find_by_scope(scope.id).await? {
                    if tx.state == TransactionState::Active {
                        self.transactions
                            .add_compensation_subscription(tx.id, &element.id, handler)
                            .await?;
                    }
                }
                break;
            }
        }

        if element.kind.is_activity() {
            self.emit(
                OutboxEvent::new(LifecycleEventType::ActivityCompleted, self.clock.now())
                    .instance(execution.process_instance_id)
                    .execution(execution.id)
                    .activity(element.id.clone()),
            )
            .await?;
        }
        Ok(())
    }

    // ─── Terminate ────────────────────────────────────────────

    async fn terminate_scope(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        execution: Execution,
        _element: &Element,
    ) -> Result<Vec<WorkItem>> {
        let pid = execution.process_instance_id;
        let scope_id = execution.scope_id;
        self.store.executions().delete(execution.id).await?;

        for other in self.store.executions().find_by_instance(pid).await? {
            if self.scope_chain_contains(other.scope_id, scope_id).await? {
                Box::pin(self.cancel_execution(definition, other)).await?;
            }
        }

        let scope = self
            .store
            .scopes()
            .find_by_id(scope_id)
            .await?
            .ok_or_else(|| EngineError::not_found("scope", scope_id))?;
        if scope.kind == ScopeKind::Process {
            self.complete_instance(pid, InstanceState::Terminated).await?;
            return Ok(Vec::new());
        }
        self.check_scope_completion(definition, pid, scope_id).await
    }

    // ─── Cancellation of executions ───────────────────────────

    /// Cancel one execution: subscriptions, tasks, owned child scopes, then
    /// the row itself. Descendant tokens cancel depth-first. Transaction
    /// scopes cancelled this way keep their compensation subscriptions
    /// (boundary-cancel semantics).
    pub(crate) async fn cancel_execution(
        self: &Arc<Self>,
        definition: &ProcessDefinition,
        execution: Execution,
    ) -> Result<()> {
        let pid = execution.process_instance_id;
        self.registry.delete_by_execution(execution.id).await?;

        let now = self.clock.now();
        for mut task in self.store.tasks().find_by_execution(execution.id).await? {
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

        let element = definition.element(&execution.element_id).ok().cloned();
        if let Some(element) = &element {
            if element.kind.is_scope() {
                // Host of a sub-process: take its children down first.
                let child_scope = self
                    .store
                    .scopes()
                    .find_by_instance(pid)
                    .await?
                    .into_iter()
                    .find(|s| {
                        s.active
                            && s.element_id.as_deref() == Some(element.id.as_str())
                            && s.parent_id == Some(execution.scope_id)
                    });
                if let Some(child_scope) = child_scope {
                    for descendant in self.store.executions().find_by_instance(pid).await? {
                        if descendant.id != execution.id
                            && self
                                .scope_chain_contains(descendant.scope_id, child_scope.id)
                                .await?
                        {
                            Box::pin(self.cancel_execution(definition, descendant)).await?;
                        }
                    }
                    if element.kind == ElementKind::Transaction {
                        if let Some(tx) =
                            self.store.transactions().find_by_scope(child_scope.id).await?
                        {
                            if tx.state == TransactionState::Active {
                                self.transactions
                                    .cancel(tx.id, false, self.as_ref())
                                    .await?;
                            }
                        }
                    }
                    self.scopes.destroy_scope(child_scope.id).await?;
                }
            }
            // Task-local scope dies with the token.
            if let Some(scope) = self.store.scopes().find_by_id(execution.scope_id).await? {
                if scope.kind == ScopeKind::Task {
                    self.scopes.destroy_scope(scope.id).await?;
                }
            }
            if element.kind.is_activity() {
                self.emit(
                    OutboxEvent::new(LifecycleEventType::ActivityCancelled, now)
                        .instance(pid)
                        .execution(execution.id)
                        .activity(element.id.clone()),
                )
                .await?;
            }
        }
        self.store.executions().delete(execution.id).await?;
        Ok(())
    }

    // ─── Event sub-process triggering ─────────────────────────

    pub(crate) async fn trigger_event_subprocess(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        start_element: &Element,
        sub: &EventSubscription,
        payload: Option<Value>,
    ) -> Result<Vec<WorkItem>> {
        let esp_id = start_element.container.clone().ok_or_else(|| {
            EngineError::Internal(format!(
                "event sub-process start `{}` has no container",
                start_element.id
            ))
        })?;
        let esp = definition.element(&esp_id)?.clone();
        let parent_scope = self.resolve_container_scope(instance, esp.container.as_deref()).await?;
        let parent_execution = sub.execution_id.unwrap_or_else(Uuid::nil);

        let triggered = self
            .event_subprocesses
            .trigger(&TriggerContext {
                definition,
                element: &esp,
                process_instance_id: instance.id,
                parent_execution_id: parent_execution,
                parent_scope_id: parent_scope,
                trigger_event: TriggerEvent {
                    event_type: sub.event_type,
                    event_name: sub.event_name.clone(),
                    start_event_id: Some(sub.activity_id.clone()),
                    event_data: payload,
                },
            })
            .await?;

        if triggered.interrupting {
            // The event sub-process replaces the current flow: every token
            // in the parent scope that is not ours goes away, subscriptions
            // included.
            for other in self.store.executions().find_by_instance(instance.id).await? {
                if other.id == triggered.execution_id {
                    continue;
                }
                if self
                    .scope_chain_contains(other.scope_id, triggered.scope_id)
                    .await?
                {
                    continue;
                }
                if self.scope_chain_contains(other.scope_id, parent_scope).await? {
                    Box::pin(self.cancel_execution(definition, other)).await?;
                }
            }
        }
        Ok(vec![WorkItem::advance(instance.id, triggered.execution_id)])
    }

    async fn resolve_container_scope(
        &self,
        instance: &ProcessInstance,
        container: Option<&str>,
    ) -> Result<Uuid> {
        match container {
            None => Ok(instance.root_scope_id),
            Some(element_id) => {
                let scope = self
                    .store
                    .scopes()
                    .find_by_instance(instance.id)
                    .await?
                    .into_iter()
                    .find(|s| s.active && s.element_id.as_deref() == Some(element_id));
                scope
                    .map(|s| s.id)
                    .ok_or_else(|| EngineError::not_found("scope for container", element_id))
            }
        }
    }

    // ─── Boundary events ──────────────────────────────────────

    pub(crate) async fn fire_boundary_event(
        self: &Arc<Self>,
        instance: &ProcessInstance,
        definition: &ProcessDefinition,
        boundary: &Element,
        _sub: &EventSubscription,
    ) -> Result<Vec<WorkItem>> {
        let host_id = boundary.attached_to.as_deref().ok_or_else(|| {
            EngineError::Definition(format!("boundary event `{}` is unattached", boundary.id))
        })?;
        let host = self
            .store
            .executions()
            .find_at_element(instance.id, host_id)
            .await?
            .into_iter()
            .find(|e| e.state == ExecutionState::Waiting);
        let host = match host {
            Some(host) => host,
            // Host already finished: the fire lost the race, absorb it.
            None => return Ok(Vec::new()),
        };
        let outer_scope = self.outer_scope_of(&host).await?;

        if boundary.interrupting {
            let parent = host.parent_id;
            self.cancel_execution(definition, host).await?;
            let execution = Execution::new(instance.id, parent, &boundary.id, outer_scope);
            self.store.executions().save(&execution).await?;
            Ok(vec![WorkItem::advance(instance.id, execution.id)])
        } else {
            let fork = Execution::new(instance.id, host.parent_id, &boundary.id, outer_scope);
            self.store.executions().save(&fork).await?;
            Ok(vec![WorkItem::advance(instance.id, fork.id)])
        }
    }

    /// The scope a boundary outflow runs in: the host's nearest enclosing
    /// non-task scope (a user task parks in its task-local scope).
    async fn outer_scope_of(&self, execution: &Execution) -> Result<Uuid> {
        for scope in self.scopes.chain(execution.scope_id).await? {
            if !matches!(scope.kind, ScopeKind::Task | ScopeKind::Local) {
                return Ok(scope.id);
            }
        }
        Ok(execution.scope_id)
    }

    // ─── BPMN error routing ───────────────────────────────────

    /// Walk outward from the throw site for a catching error boundary or
    /// event sub-process; an uncaught error fails the instance.
    pub(crate) async fn route_bpmn_error(
        self: &Arc<Self>,
        item: &WorkItem,
        code: &str,
        message: &str,
    ) -> Result<Vec<WorkItem>> {
        let execution_id = item
            .execution_id
            .ok_or_else(|| EngineError::Internal("BPMN error without execution".into()))?;
        let execution = match self.store.executions().find_by_id(execution_id).await? {
            Some(execution) => execution,
            None => return Ok(Vec::new()),
        };
        let instance = self.load_instance(execution.process_instance_id).await?;
        let definition = self.load_definition(&instance).await?;
        let element = definition.element(&execution.element_id)?.clone();

        // 1. Error boundary on the throwing activity itself.
        if element.kind.is_activity() {
            if let Some(boundary) = find_error_boundary(&definition, &element.id, code) {
                let boundary = boundary.clone();
                self.emit_error_caught(&instance, &boundary.id, code).await?;
                let outer_scope = self.outer_scope_of(&execution).await?;
                let parent = execution.parent_id;
                self.cancel_execution(&definition, execution).await?;
                let handler = Execution::new(instance.id, parent, &boundary.id, outer_scope);
                self.store.executions().save(&handler).await?;
                return Ok(vec![WorkItem::advance(instance.id, handler.id)]);
            }
        }

        // 2. Walk enclosing scopes: event sub-process first (closer), then
        //    the boundary on the scope's own element.
        for scope in self.scopes.chain(execution.scope_id).await? {
            let container = match scope.kind {
                ScopeKind::Process => None,
                ScopeKind::SubProcess | ScopeKind::Transaction => scope.element_id.as_deref(),
                _ => continue,
            };

            for esp in definition.event_subprocesses_of(container) {
                if let Some(start) = find_error_start(&definition, esp, code) {
                    self.emit_error_caught(&instance, &start.id, code).await?;
                    let sub = EventSubscription {
                        id: Uuid::nil(),
                        process_instance_id: Some(instance.id),
                        execution_id: Some(execution.id),
                        activity_id: start.id.clone(),
                        event_type: EventType::Error,
                        event_name: Some(code.to_string()),
                        config: SubscriptionConfig::None,
                        create_time: self.clock.now(),
                    };
                    let start = start.clone();
                    self.store.executions().delete(execution.id).await?;
                    return self
                        .trigger_event_subprocess(
                            &instance,
                            &definition,
                            &start,
                            &sub,
                            Some(serde_json::json!({ "code": code, "message": message })),
                        )
                        .await;
                }
            }

            if let Some(container_id) = container {
                if let Some(boundary) = find_error_boundary(&definition, container_id, code) {
                    let boundary = boundary.clone();
                    self.emit_error_caught(&instance, &boundary.id, code).await?;
                    self.store.executions().delete(execution.id).await?;
                    let host = self
                        .store
                        .executions()
                        .find_at_element(instance.id, container_id)
                        .await?
                        .into_iter()
                        .find(|e| e.state == ExecutionState::Waiting);
                    if let Some(host) = host {
                        return self
                            .fire_boundary_event(
                                &instance,
                                &definition,
                                &boundary,
                                &EventSubscription {
                                    id: Uuid::nil(),
                                    process_instance_id: Some(instance.id),
                                    execution_id: Some(host.id),
                                    activity_id: boundary.id.clone(),
                                    event_type: EventType::Error,
                                    event_name: Some(code.to_string()),
                                    config: SubscriptionConfig::None,
                                    create_time: self.clock.now(),
                                },
                            )
                            .await;
                    }
                    return Ok(Vec::new());
                }
            }
        }

        // 3. Uncaught: the instance fails.
        tracing::warn!(
            instance = %instance.id,
            code,
            "uncaught BPMN error, failing instance"
        );
        let mut failed = execution;
        failed.state = ExecutionState::Failed;
        self.store.executions().update(&failed).await?;
        self.complete_instance(instance.id, InstanceState::Failed).await?;
        Err(EngineError::Bpmn {
            code: code.to_string(),
            message: message.to_string(),
        })
    }

    async fn emit_error_caught(
        &self,
        instance: &ProcessInstance,
        catcher_id: &str,
        code: &str,
    ) -> Result<()> {
        self.emit(
            OutboxEvent::new(LifecycleEventType::ErrorCaught, self.clock.now())
                .instance(instance.id)
                .activity(catcher_id.to_string())
                .payload(serde_json::json!({ "code": code })),
        )
        .await
    }
}

// ─── Free helpers ─────────────────────────────────────────────

pub(crate) fn flow_targets(definition: &ProcessDefinition, element: &Element) -> Vec<String> {
    definition
        .outgoing_flows(element)
        .iter()
        .map(|f| f.target.clone())
        .collect()
}

/// Nearest matching error boundary on an activity: a named match beats the
/// catch-all.
fn find_error_boundary<'d>(
    definition: &'d ProcessDefinition,
    activity_id: &str,
    code: &str,
) -> Option<&'d Element> {
    let boundaries = definition.boundary_events_of(activity_id);
    boundaries
        .iter()
        .find(|b| {
            matches!(&b.event, Some(EventDefinition::Error { error_ref: Some(c) }) if c == code)
        })
        .or_else(|| {
            boundaries
                .iter()
                .find(|b| matches!(&b.event, Some(EventDefinition::Error { error_ref: None })))
        })
        .copied()
}

fn find_error_start<'d>(
    definition: &'d ProcessDefinition,
    esp: &Element,
    code: &str,
) -> Option<&'d Element> {
    let starts = definition.start_events(Some(&esp.id));
    starts
        .iter()
        .find(|s| {
            matches!(&s.event, Some(EventDefinition::Error { error_ref: Some(c) }) if c == code)
        })
        .or_else(|| {
            starts
                .iter()
                .find(|s| matches!(&s.event, Some(EventDefinition::Error { error_ref: None })))
        })
        .copied()
}
