//! Event sub-processes: scopes started by an event instead of a sequence
//! flow, running interrupting or non-interrupting to their parent.
//!
//! `register` is called when the enclosing scope opens and plants one
//! subscription per classifiable start event. `trigger` opens the scope,
//! snapshots parent variables, injects event data, and hands the next
//! element ids back to the interpreter, which applies the interrupting
//! semantics.

use crate::clock::Clock;
use crate::definition::{Element, ElementKind, EventDefinition, ProcessDefinition};
use crate::error::{EngineError, Result};
use crate::expr;
use crate::model::{
    EventType, Execution, ExecutionState, ScopeKind, SubscriptionConfig, TimerCycle,
};
use crate::scope::ScopeManager;
use crate::store::EngineStore;
use crate::subscription::{NewSubscription, SubscriptionRegistry};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub struct EventSubProcessExecutor {
    store: Arc<dyn EngineStore>,
    registry: Arc<SubscriptionRegistry>,
    scopes: Arc<ScopeManager>,
    clock: Arc<dyn Clock>,
}

/// The stimulus delivered to `trigger`.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub event_type: EventType,
    pub event_name: Option<String>,
    /// Fired start event, when the caller already knows it (timer and
    /// conditional subscriptions carry it as their activity id).
    pub start_event_id: Option<String>,
    pub event_data: Option<Value>,
}

pub struct RegisterContext<'a> {
    pub definition: &'a ProcessDefinition,
    pub element: &'a Element,
    pub process_instance_id: Uuid,
    pub parent_execution_id: Uuid,
    pub parent_scope_id: Uuid,
}

pub struct TriggerContext<'a> {
    pub definition: &'a ProcessDefinition,
    pub element: &'a Element,
    pub process_instance_id: Uuid,
    pub parent_execution_id: Uuid,
    pub parent_scope_id: Uuid,
    pub trigger_event: TriggerEvent,
}

#[derive(Debug, Clone)]
pub struct EventSubscriptionInfo {
    pub subscription_id: Uuid,
    pub start_event_id: String,
    pub event_type: EventType,
    pub interrupting: bool,
}

#[derive(Debug, Clone)]
pub struct TriggeredEventSubProcess {
    pub execution_id: Uuid,
    pub scope_id: Uuid,
    pub start_event_id: String,
    pub next_element_ids: Vec<String>,
    pub interrupting: bool,
}

impl EventSubProcessExecutor {
    pub fn new(
        store: Arc<dyn EngineStore>,
        registry: Arc<SubscriptionRegistry>,
        scopes: Arc<ScopeManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            scopes,
            clock,
        }
    }

    /// Structural checks, enforced again at runtime entry.
    pub fn validate(definition: &ProcessDefinition, element: &Element) -> Result<()> {
        if element.kind != ElementKind::EventSubProcess {
            return Err(EngineError::Definition(format!(
                "`{}` is not an event sub-process",
                element.id
            )));
        }
        if !element.incoming.is_empty() {
            return Err(EngineError::Definition(format!(
                "event sub-process `{}` has incoming sequence flows",
                element.id
            )));
        }
        let starts = definition.start_events(Some(&element.id));
        if starts.is_empty() {
            return Err(EngineError::Definition(format!(
                "event sub-process `{}` has no start event",
                element.id
            )));
        }
        for start in starts {
            if start.event.is_none() {
                return Err(EngineError::Definition(format!(
                    "start event `{}` carries no event definition",
                    start.id
                )));
            }
        }
        Ok(())
    }

    /// Register listeners for every start event of the event sub-process.
    /// Conditional start events are gated: the expression is evaluated now
    /// against the parent scope and only a true gate subscribes.
    pub async fn register(&self, ctx: &RegisterContext<'_>) -> Result<Vec<EventSubscriptionInfo>> {
        Self::validate(ctx.definition, ctx.element)?;
        let mut infos = Vec::new();

        for start in ctx.definition.start_events(Some(&ctx.element.id)) {
            let event = start.event.as_ref().expect("validated above");
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
                        SubscriptionConfig::Timer {
                            due: timer.due_from(self.clock.now()),
                            cycle,
                        },
                    )
                }
                EventDefinition::Error { error_ref } => (
                    EventType::Error,
                    error_ref.clone(),
                    SubscriptionConfig::None,
                ),
                EventDefinition::Conditional { condition } => {
                    let vars = self.scopes.get_variables(ctx.parent_scope_id).await?;
                    if !expr::evaluate_condition(condition, &vars, None).unwrap_or(false) {
                        continue;
                    }
                    (
                        EventType::Conditional,
                        None,
                        SubscriptionConfig::Conditional {
                            expression: condition.clone(),
                            last_value: false,
                        },
                    )
                }
                other => {
                    return Err(EngineError::Definition(format!(
                        "start event `{}` has unsupported event definition {other:?}",
                        start.id
                    )))
                }
            };

            let sub = self
                .registry
                .create(NewSubscription {
                    process_instance_id: Some(ctx.process_instance_id),
                    execution_id: Some(ctx.parent_execution_id),
                    activity_id: start.id.clone(),
                    event_type,
                    event_name,
                    config,
                })
                .await?;
            infos.push(EventSubscriptionInfo {
                subscription_id: sub.id,
                start_event_id: start.id.clone(),
                event_type,
                interrupting: start.interrupting,
            });
        }
        Ok(infos)
    }

    /// Open the event sub-process for a delivered event. The caller applies
    /// the returned `interrupting` flag: suspend-and-cancel the parent flow,
    /// or run in parallel.
    pub async fn trigger(&self, ctx: &TriggerContext<'_>) -> Result<TriggeredEventSubProcess> {
        let trigger = &ctx.trigger_event;
        let start = self
            .find_matching_start(ctx.definition, ctx.element, trigger)?
            .ok_or_else(|| {
                EngineError::not_found(
                    "matching start event",
                    format!(
                        "{}:{:?}/{:?}",
                        ctx.element.id, trigger.event_type, trigger.event_name
                    ),
                )
            })?;

        let scope_id = self
            .scopes
            .create_scope(
                ctx.process_instance_id,
                Some(ctx.parent_scope_id),
                ScopeKind::EventSubProcess,
                Some(&ctx.element.id),
            )
            .await?;
        self.scopes
            .copy_variables(ctx.parent_scope_id, scope_id, None)
            .await?;
        if let Some(data) = &trigger.event_data {
            self.scopes
                .set_variable(scope_id, "eventData", data.clone())
                .await?;
        }

        let mut execution = Execution::new(
            ctx.process_instance_id,
            Some(ctx.parent_execution_id),
            start.id.clone(),
            scope_id,
        );
        execution.state = ExecutionState::Running;
        self.store.executions().save(&execution).await?;

        let next_element_ids: Vec<String> = ctx
            .definition
            .outgoing_flows(start)
            .iter()
            .map(|f| f.target.clone())
            .collect();

        Ok(TriggeredEventSubProcess {
            execution_id: execution.id,
            scope_id,
            start_event_id: start.id.clone(),
            next_element_ids,
            interrupting: start.interrupting,
        })
    }

    fn find_matching_start<'d>(
        &self,
        definition: &'d ProcessDefinition,
        element: &Element,
        trigger: &TriggerEvent,
    ) -> Result<Option<&'d Element>> {
        let starts = definition.start_events(Some(&element.id));
        if let Some(start_id) = &trigger.start_event_id {
            return Ok(starts.into_iter().find(|s| &s.id == start_id));
        }
        Ok(starts.into_iter().find(|s| match (&s.event, trigger.event_type) {
            (Some(EventDefinition::Signal { signal_ref }), EventType::Signal) => {
                Some(signal_ref.as_str()) == trigger.event_name.as_deref()
            }
            (Some(EventDefinition::Message { message_ref }), EventType::Message) => {
                Some(message_ref.as_str()) == trigger.event_name.as_deref()
            }
            (Some(EventDefinition::Error { error_ref }), EventType::Error) => {
                // A named catch beats nothing; None catches any error.
                error_ref.is_none() || error_ref.as_deref() == trigger.event_name.as_deref()
            }
            (Some(EventDefinition::Timer { .. }), EventType::Timer) => true,
            (Some(EventDefinition::Conditional { .. }), EventType::Conditional) => true,
            _ => false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::definition::{DefinitionBuilder, TimerSpec};
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn definition_with_esp() -> ProcessDefinition {
        DefinitionBuilder::new("p")
            .element(Element::new("start", ElementKind::StartEvent))
            .element(Element::new("work", ElementKind::UserTask))
            .element(Element::new("end", ElementKind::EndEvent))
            .element(Element::new("esp", ElementKind::EventSubProcess))
            .element(
                Element::new("esp_start", ElementKind::StartEvent)
                    .in_container("esp")
                    .with_event(EventDefinition::Signal {
                        signal_ref: "cancelIt".into(),
                    }),
            )
            .element(Element::new("esp_task", ElementKind::ServiceTask)
                .in_container("esp")
                .with_task_type("cleanup"))
            .element(Element::new("esp_end", ElementKind::EndEvent).in_container("esp"))
            .flow("f1", "start", "work")
            .flow("f2", "work", "end")
            .flow("f3", "esp_start", "esp_task")
            .flow("f4", "esp_task", "esp_end")
            .build()
            .unwrap()
    }

    struct Fixture {
        executor: EventSubProcessExecutor,
        scopes: Arc<ScopeManager>,
        store: Arc<MemoryStore>,
        pid: Uuid,
        parent_execution: Uuid,
        parent_scope: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
        let registry = Arc::new(SubscriptionRegistry::new(
            store.clone() as Arc<dyn EngineStore>,
            clock.clone(),
        ));
        let scopes = Arc::new(ScopeManager::new(
            store.clone() as Arc<dyn EngineStore>,
            clock.clone(),
        ));
        let executor = EventSubProcessExecutor::new(
            store.clone() as Arc<dyn EngineStore>,
            registry,
            scopes.clone(),
            clock,
        );
        let pid = Uuid::now_v7();
        let parent_scope = scopes
            .create_scope(pid, None, ScopeKind::Process, None)
            .await
            .unwrap();
        Fixture {
            executor,
            scopes,
            store,
            pid,
            parent_execution: Uuid::now_v7(),
            parent_scope,
        }
    }

    #[tokio::test]
    async fn register_creates_signal_subscription() {
        let def = definition_with_esp();
        let fx = fixture().await;
        let infos = fx
            .executor
            .register(&RegisterContext {
                definition: &def,
                element: def.element("esp").unwrap(),
                process_instance_id: fx.pid,
                parent_execution_id: fx.parent_execution,
                parent_scope_id: fx.parent_scope,
            })
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].event_type, EventType::Signal);
        assert!(infos[0].interrupting);

        let subs = fx.store.subscriptions().find_by_instance(fx.pid).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].event_name.as_deref(), Some("cancelIt"));
    }

    #[tokio::test]
    async fn trigger_opens_scope_and_injects_event_data() {
        let def = definition_with_esp();
        let fx = fixture().await;
        fx.scopes
            .set_variable(fx.parent_scope, "order", json!(42))
            .await
            .unwrap();

        let triggered = fx
            .executor
            .trigger(&TriggerContext {
                definition: &def,
                element: def.element("esp").unwrap(),
                process_instance_id: fx.pid,
                parent_execution_id: fx.parent_execution,
                parent_scope_id: fx.parent_scope,
                trigger_event: TriggerEvent {
                    event_type: EventType::Signal,
                    event_name: Some("cancelIt".into()),
                    start_event_id: None,
                    event_data: Some(json!({"reason": "user"})),
                },
            })
            .await
            .unwrap();

        assert_eq!(triggered.next_element_ids, vec!["esp_task"]);
        assert!(triggered.interrupting);
        let vars = fx.scopes.get_variables(triggered.scope_id).await.unwrap();
        assert_eq!(vars.get("order"), Some(&json!(42)));
        assert_eq!(vars.get("eventData"), Some(&json!({"reason": "user"})));
    }

    #[tokio::test]
    async fn trigger_without_matching_start_fails() {
        let def = definition_with_esp();
        let fx = fixture().await;
        let err = fx
            .executor
            .trigger(&TriggerContext {
                definition: &def,
                element: def.element("esp").unwrap(),
                process_instance_id: fx.pid,
                parent_execution_id: fx.parent_execution,
                parent_scope_id: fx.parent_scope,
                trigger_event: TriggerEvent {
                    event_type: EventType::Signal,
                    event_name: Some("unrelated".into()),
                    start_event_id: None,
                    event_data: None,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn conditional_start_gated_at_registration() {
        let def = DefinitionBuilder::new("p")
            .element(Element::new("start", ElementKind::StartEvent))
            .element(Element::new("end", ElementKind::EndEvent))
            .element(Element::new("esp", ElementKind::EventSubProcess))
            .element(
                Element::new("esp_start", ElementKind::StartEvent)
                    .in_container("esp")
                    .with_event(EventDefinition::Conditional {
                        condition: "${armed == true}".into(),
                    }),
            )
            .element(Element::new("esp_end", ElementKind::EndEvent).in_container("esp"))
            .flow("f1", "start", "end")
            .flow("f2", "esp_start", "esp_end")
            .build()
            .unwrap();
        let fx = fixture().await;

        // Gate false (variable absent): no subscription.
        let infos = fx
            .executor
            .register(&RegisterContext {
                definition: &def,
                element: def.element("esp").unwrap(),
                process_instance_id: fx.pid,
                parent_execution_id: fx.parent_execution,
                parent_scope_id: fx.parent_scope,
            })
            .await
            .unwrap();
        assert!(infos.is_empty());

        fx.scopes
            .set_variable(fx.parent_scope, "armed", json!(true))
            .await
            .unwrap();
        let infos = fx
            .executor
            .register(&RegisterContext {
                definition: &def,
                element: def.element("esp").unwrap(),
                process_instance_id: fx.pid,
                parent_execution_id: fx.parent_execution,
                parent_scope_id: fx.parent_scope,
            })
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].event_type, EventType::Conditional);
    }
}
