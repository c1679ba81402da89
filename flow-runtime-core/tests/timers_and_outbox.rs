//! Timer recovery, outbox delivery guarantees, and projection behavior.

mod common;

use async_trait::async_trait;
use common::*;
use flow_runtime_core::bus::{EventBus, EventSubscriber, InMemoryBus};
use flow_runtime_core::clock::ManualClock;
use flow_runtime_core::definition::{
    DefinitionBuilder, Element, ElementKind, EventDefinition, ProcessDefinition, TimerSpec,
};
use flow_runtime_core::error::{EngineError, Result};
use flow_runtime_core::handler::{HandlerOutcome, ServiceTaskContext, ServiceTaskHandler};
use flow_runtime_core::model::{ExecutionState, InstanceState, TaskState};
use flow_runtime_core::outbox::{LifecycleEventType, OutboxEvent, OutboxStatus};
use flow_runtime_core::runtime::ProcessRuntime;
use flow_runtime_core::store::EngineStore;
use flow_runtime_core::store_memory::MemoryStore;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

fn timer_wait_definition() -> ProcessDefinition {
    DefinitionBuilder::new("delayed")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("wait_minute", ElementKind::IntermediateCatchEvent).with_event(
                EventDefinition::Timer {
                    timer: TimerSpec::parse("PT1M").unwrap(),
                },
            ),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "wait_minute")
        .flow("f2", "wait_minute", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn timer_survives_restart_and_fires_overdue() {
    let rig = rig().await;
    let def = rig.runtime.deploy(timer_wait_definition()).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let executions = rig.store.executions().find_by_instance(pid).await.unwrap();
    assert_eq!(executions[0].state, ExecutionState::Waiting);

    // "Restart": a fresh runtime over the same store, two minutes later.
    let clock = Arc::new(ManualClock::at_epoch());
    clock.advance(chrono::Duration::minutes(2));
    let revived = ProcessRuntime::builder(rig.store.clone() as Arc<dyn EngineStore>)
        .bus(Arc::new(InMemoryBus::new()))
        .clock(clock)
        .build()
        .await;

    let fired = revived.poll_timers().await.unwrap();
    assert_eq!(fired, 1);

    let instance = revived.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    let kinds = event_kinds(&rig.store, pid).await;
    assert_eq!(count_kind(&kinds, LifecycleEventType::TimerFired), 1);
}

#[tokio::test]
async fn interrupting_timer_boundary_cancels_user_task() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("deadline")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("review", ElementKind::UserTask))
        .element(
            Element::new("too_late", ElementKind::BoundaryEvent)
                .attached("review")
                .with_event(EventDefinition::Timer {
                    timer: TimerSpec::parse("PT1M").unwrap(),
                }),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .element(Element::new("escalated_end", ElementKind::EndEvent))
        .flow("f1", "start", "review")
        .flow("f2", "review", "end")
        .flow("f3", "too_late", "escalated_end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    rig.clock.advance(chrono::Duration::minutes(2));
    let fired = rig.runtime.poll_timers().await.unwrap();
    assert_eq!(fired, 1);

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Cancelled);
}

#[tokio::test]
async fn timer_start_event_spawns_instances_per_cycle() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("nightly")
        .element(
            Element::new("every_10s", ElementKind::StartEvent).with_event(
                EventDefinition::Timer {
                    timer: TimerSpec::parse("R2/PT10S").unwrap(),
                },
            ),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "every_10s", "end")
        .build()
        .unwrap();
    rig.runtime.deploy(def).await.unwrap();

    rig.clock.advance(chrono::Duration::seconds(11));
    assert_eq!(rig.runtime.poll_timers().await.unwrap(), 1);
    rig.clock.advance(chrono::Duration::seconds(11));
    assert_eq!(rig.runtime.poll_timers().await.unwrap(), 1);
    // Cycle exhausted after two fires.
    rig.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(rig.runtime.poll_timers().await.unwrap(), 0);
}

// ─── Outbox delivery ──────────────────────────────────────────

/// Bus that fails every publish while `failing` is set and counts
/// deliveries per event id.
#[derive(Default)]
struct FlakyBus {
    failing: AtomicBool,
    deliveries: Mutex<HashMap<Uuid, usize>>,
}

#[async_trait]
impl EventBus for FlakyBus {
    async fn publish(&self, _topic: &str, event: &OutboxEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::OutboxPublishFailed("broker offline".into()));
        }
        *self.deliveries.lock().await.entry(event.id).or_insert(0) += 1;
        Ok(())
    }

    async fn subscribe(&self, _prefix: &str, _subscriber: Arc<dyn EventSubscriber>) {}
}

#[tokio::test]
async fn outbox_retries_failed_rows_until_published() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let bus = Arc::new(FlakyBus::default());
    bus.failing.store(true, Ordering::SeqCst);

    let runtime = ProcessRuntime::builder(store.clone() as Arc<dyn EngineStore>)
        .bus(bus.clone())
        .clock(clock.clone())
        .without_history()
        .build()
        .await;

    let def = DefinitionBuilder::new("trivial")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "end")
        .build()
        .unwrap();
    let def = runtime.deploy(def).await.unwrap();
    let pid = runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    // First tick: every row fails and is marked for retry.
    assert_eq!(runtime.publisher().publish_batch().await.unwrap(), 0);
    let failed = store
        .outbox()
        .find_by_status(OutboxStatus::Failed, 100)
        .await
        .unwrap();
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|e| e.retry_count == 1));
    assert!(failed
        .iter()
        .all(|e| e.error_message.as_deref() == Some("outbox publish failed: broker offline")));

    // Retry sweep flips them back to pending; the broker recovers.
    let reset = runtime.publisher().retry_failed().await.unwrap();
    assert_eq!(reset, failed.len());
    bus.failing.store(false, Ordering::SeqCst);
    let published = runtime.publisher().publish_batch().await.unwrap();
    assert_eq!(published, failed.len());

    let events = store.outbox().find_by_instance(pid).await.unwrap();
    assert!(events.iter().all(|e| e.status == OutboxStatus::Published));
    assert!(events.iter().all(|e| e.retry_count == 1));

    // Exactly one delivery per row reached the subscriber.
    let deliveries = bus.deliveries.lock().await;
    for event in &events {
        assert_eq!(deliveries.get(&event.id), Some(&1));
    }
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_row() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let bus = Arc::new(FlakyBus::default());
    bus.failing.store(true, Ordering::SeqCst);
    let runtime = ProcessRuntime::builder(store.clone() as Arc<dyn EngineStore>)
        .bus(bus.clone())
        .clock(clock)
        .without_history()
        .build()
        .await;

    let def = DefinitionBuilder::new("trivial")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "end")
        .build()
        .unwrap();
    let def = runtime.deploy(def).await.unwrap();
    runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    for _ in 0..10 {
        runtime.publisher().publish_batch().await.unwrap();
        runtime.publisher().retry_failed().await.unwrap();
    }
    // Rows hit their budget and stay failed; the retry sweep leaves them.
    let failed = store
        .outbox()
        .find_by_status(OutboxStatus::Failed, 100)
        .await
        .unwrap();
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|e| e.retry_count >= e.max_retries));
    assert_eq!(runtime.publisher().retry_failed().await.unwrap(), 0);
}

#[tokio::test]
async fn history_projector_marks_rows_processed_and_janitor_purges() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("linear")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("approve", ElementKind::UserTask).named("approve"))
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "approve")
        .flow("f2", "approve", "end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();
    let task_id = rig.runtime.tasks(pid).await.unwrap()[0].id;
    rig.runtime.claim_task(task_id, "alice").await.unwrap();
    rig.runtime.complete_task(task_id, None).await.unwrap();

    rig.runtime.publisher().publish_batch().await.unwrap();

    // Projection: process + activity + task rows.
    let process = rig.store.history().find_process(pid).await.unwrap().unwrap();
    assert_eq!(process.state, "COMPLETED");
    assert!(process.end_time.is_some());
    let activities = rig.store.history().find_activities(pid).await.unwrap();
    assert!(activities.iter().any(|a| a.element_id == "approve" && a.end_time.is_some()));
    let tasks = rig.store.history().find_tasks(pid).await.unwrap();
    assert_eq!(tasks[0].state, "COMPLETED");
    assert_eq!(tasks[0].assignee.as_deref(), Some("alice"));

    // Every published row was consumed by the projector.
    let events = rig.store.outbox().find_by_instance(pid).await.unwrap();
    assert!(events.iter().all(|e| e.status == OutboxStatus::Processed));

    // Janitor: nothing purged inside retention, everything after.
    assert_eq!(rig.runtime.publisher().purge_processed().await.unwrap(), 0);
    rig.clock.advance(chrono::Duration::days(31));
    let purged = rig.runtime.publisher().purge_processed().await.unwrap();
    assert_eq!(purged, events.len());
}

// ─── Signals, messages, async work ────────────────────────────

#[tokio::test]
async fn signal_fans_out_and_duplicate_delivery_is_absorbed() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("waiter")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("catch", ElementKind::IntermediateCatchEvent).with_event(
                EventDefinition::Signal {
                    signal_ref: "go".into(),
                },
            ),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "catch")
        .flow("f2", "catch", "end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();

    let pid_a = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();
    let pid_b = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    rig.runtime.signal("go", None, None).await.unwrap();
    rig.runtime.signal("go", None, None).await.unwrap();

    for pid in [pid_a, pid_b] {
        let instance = rig.runtime.instance(pid).await.unwrap();
        assert_eq!(instance.state, InstanceState::Completed);
        let kinds = event_kinds(&rig.store, pid).await;
        assert_eq!(
            count_kind(&kinds, LifecycleEventType::ProcessInstanceEnd),
            1
        );
        assert_eq!(count_kind(&kinds, LifecycleEventType::SignalReceived), 1);
    }
}

#[tokio::test]
async fn message_delivers_to_single_correlated_instance() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("order_wait")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("wait_payment", ElementKind::IntermediateCatchEvent).with_event(
                EventDefinition::Message {
                    message_ref: "payment".into(),
                },
            ),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "wait_payment")
        .flow("f2", "wait_payment", "end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();

    let pid_a = rig
        .runtime
        .start_process(def.id, Some("order-1".into()), Map::new(), None)
        .await
        .unwrap();
    let pid_b = rig
        .runtime
        .start_process(def.id, Some("order-2".into()), Map::new(), None)
        .await
        .unwrap();

    rig.runtime
        .deliver_message("payment", Some("order-2"), Some(json!({"amount": 10})))
        .await
        .unwrap();

    assert_eq!(
        rig.runtime.instance(pid_b).await.unwrap().state,
        InstanceState::Completed
    );
    assert_eq!(
        rig.runtime.instance(pid_a).await.unwrap().state,
        InstanceState::Active
    );

    // No waiting subscription and no message start event: NotFound.
    let err = rig
        .runtime
        .deliver_message("unknown", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn async_service_work_parks_and_resumes() {
    struct AsyncHandler;
    #[async_trait]
    impl ServiceTaskHandler for AsyncHandler {
        async fn execute(&self, _ctx: ServiceTaskContext) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::Async)
        }
    }
    let rig = rig_with_handlers(vec![("export", Arc::new(AsyncHandler))]).await;
    let def = DefinitionBuilder::new("exporter")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("export", ElementKind::ServiceTask).with_task_type("export"),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "export")
        .flow("f2", "export", "end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let executions = rig.store.executions().find_by_instance(pid).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].state, ExecutionState::Waiting);

    let mut result = Map::new();
    result.insert("exported".to_string(), json!(true));
    rig.runtime
        .complete_async_work(executions[0].id, Some(result))
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
}

#[tokio::test]
async fn incident_resolution_reruns_failed_work() {
    struct SometimesFails {
        ok: AtomicBool,
    }
    #[async_trait]
    impl ServiceTaskHandler for SometimesFails {
        async fn execute(&self, _ctx: ServiceTaskContext) -> Result<HandlerOutcome> {
            if self.ok.load(Ordering::SeqCst) {
                Ok(HandlerOutcome::Complete(Map::new()))
            } else {
                Err(EngineError::Internal("downstream unavailable".into()))
            }
        }
    }
    let handler = Arc::new(SometimesFails {
        ok: AtomicBool::new(false),
    });
    let rig = rig_with_handlers(vec![("sync", handler.clone())]).await;
    let def = DefinitionBuilder::new("brittle")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("sync", ElementKind::ServiceTask)
                .with_task_type("sync")
                .with_retries(2, 1),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "sync")
        .flow("f2", "sync", "end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let incidents = rig.store.incidents().find_open_by_instance(pid).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].retry_count, 2);

    handler.ok.store(true, Ordering::SeqCst);
    rig.runtime
        .resolve_incident(incidents[0].id, "fixed downstream")
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    let kinds = event_kinds(&rig.store, pid).await;
    assert_subsequence(
        &kinds,
        &[
            LifecycleEventType::IncidentRaised,
            LifecycleEventType::IncidentResolved,
            LifecycleEventType::ProcessInstanceEnd,
        ],
    );
}

#[tokio::test]
async fn conditional_catch_fires_on_transition_to_true() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("threshold")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("fork", ElementKind::ParallelGateway))
        .element(
            Element::new("watch", ElementKind::IntermediateCatchEvent).with_event(
                EventDefinition::Conditional {
                    condition: "${level > 100}".into(),
                },
            ),
        )
        .element(Element::new("raise", ElementKind::UserTask))
        .element(Element::new("watched_end", ElementKind::EndEvent))
        .element(Element::new("raised_end", ElementKind::EndEvent))
        .flow("f1", "start", "fork")
        .flow("f2", "fork", "watch")
        .flow("f3", "fork", "raise")
        .flow("f4", "watch", "watched_end")
        .flow("f5", "raise", "raised_end")
        .build()
        .unwrap();
    let mut vars = Map::new();
    vars.insert("level".to_string(), json!(10));
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, vars, None)
        .await
        .unwrap();

    // Still below threshold: both branches parked.
    let task_id = rig.runtime.tasks(pid).await.unwrap()[0].id;
    let mut vars = Map::new();
    vars.insert("level".to_string(), json!(250));
    rig.runtime.complete_task(task_id, Some(vars)).await.unwrap();

    // The write crossed the threshold; the conditional branch fired and the
    // whole instance finished.
    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
}
