//! End-to-end interpreter scenarios over the in-memory store.

mod common;

use async_trait::async_trait;
use common::*;
use flow_runtime_core::definition::{
    DefinitionBuilder, Element, ElementKind, EventDefinition, ProcessDefinition,
};
use flow_runtime_core::error::Result;
use flow_runtime_core::handler::{HandlerOutcome, ServiceTaskContext, ServiceTaskHandler};
use flow_runtime_core::model::{InstanceState, TaskState, TransactionState};
use flow_runtime_core::outbox::LifecycleEventType;
use flow_runtime_core::store::EngineStore;
use serde_json::{json, Map};
use std::sync::Arc;
use tokio::sync::Mutex;

fn linear_definition() -> ProcessDefinition {
    DefinitionBuilder::new("linear")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("approve", ElementKind::UserTask).named("approve"))
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "approve")
        .flow("f2", "approve", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn linear_flow_completes_with_ordered_outbox() {
    let rig = rig().await;
    let def = rig.runtime.deploy(linear_definition()).await.unwrap();

    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Created);
    assert_eq!(tasks[0].name.as_deref(), Some("approve"));

    let mut vars = Map::new();
    vars.insert("decision".to_string(), json!("yes"));
    rig.runtime
        .complete_task(tasks[0].id, Some(vars))
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    assert!(instance.end_time.is_some());

    let kinds = event_kinds(&rig.store, pid).await;
    assert_subsequence(
        &kinds,
        &[
            LifecycleEventType::ProcessInstanceStart,
            LifecycleEventType::ActivityStarted,
            LifecycleEventType::TaskCreated,
            LifecycleEventType::TaskCompleted,
            LifecycleEventType::ActivityCompleted,
            LifecycleEventType::ProcessInstanceEnd,
        ],
    );
    assert_eq!(
        count_kind(&kinds, LifecycleEventType::ProcessInstanceEnd),
        1
    );

    // The supplied task variable landed in the root scope.
    let vars = rig.runtime.variables(pid).await.ok();
    // Root scope is destroyed on completion; the variable write is visible
    // in the outbox instead.
    assert!(vars.map(|v| v.is_empty()).unwrap_or(true));
    assert_eq!(count_kind(&kinds, LifecycleEventType::VariableCreated), 1);
}

fn xor_definition() -> ProcessDefinition {
    DefinitionBuilder::new("routing")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("gw", ElementKind::ExclusiveGateway).with_default_flow("to_b"))
        .element(Element::new("task_a", ElementKind::UserTask))
        .element(Element::new("task_b", ElementKind::UserTask))
        .element(Element::new("end_a", ElementKind::EndEvent))
        .element(Element::new("end_b", ElementKind::EndEvent))
        .flow("f1", "start", "gw")
        .conditional_flow("to_a", "gw", "task_a", "${x > 10}")
        .flow("to_b", "gw", "task_b")
        .flow("f2", "task_a", "end_a")
        .flow("f3", "task_b", "end_b")
        .build()
        .unwrap()
}

#[tokio::test]
async fn exclusive_gateway_routes_on_condition() {
    let rig = rig().await;
    let def = rig.runtime.deploy(xor_definition()).await.unwrap();

    let mut vars = Map::new();
    vars.insert("x".to_string(), json!(20));
    let pid = rig
        .runtime
        .start_process(def.id, None, vars, None)
        .await
        .unwrap();
    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks[0].element_id, "task_a");

    let mut vars = Map::new();
    vars.insert("x".to_string(), json!(5));
    let pid = rig
        .runtime
        .start_process(def.id, None, vars, None)
        .await
        .unwrap();
    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks[0].element_id, "task_b");
}

#[tokio::test]
async fn exclusive_gateway_without_variable_raises_incident() {
    let rig = rig().await;
    let def = rig.runtime.deploy(xor_definition()).await.unwrap();

    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let incidents = rig.store.incidents().find_open_by_instance(pid).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].element_id, "gw");
    assert!(incidents[0].error_message.contains("expression"));

    let kinds = event_kinds(&rig.store, pid).await;
    assert_eq!(count_kind(&kinds, LifecycleEventType::IncidentRaised), 1);
    // The instance is stuck, not terminated.
    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Active);
}

fn signal_esp_definition() -> ProcessDefinition {
    DefinitionBuilder::new("escalation")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("wait_task", ElementKind::UserTask))
        .element(Element::new("end", ElementKind::EndEvent))
        .element(Element::new("esp", ElementKind::EventSubProcess))
        .element(
            Element::new("esp_start", ElementKind::StartEvent)
                .in_container("esp")
                .with_event(EventDefinition::Signal {
                    signal_ref: "cancelIt".into(),
                }),
        )
        .element(Element::new("esp_end", ElementKind::EndEvent).in_container("esp"))
        .flow("f1", "start", "wait_task")
        .flow("f2", "wait_task", "end")
        .flow("f3", "esp_start", "esp_end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn interrupting_signal_event_subprocess_replaces_flow() {
    let rig = rig().await;
    let def = rig.runtime.deploy(signal_esp_definition()).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    // Parked in the user task with the task wait plus the signal listener.
    let subs = rig.store.subscriptions().find_by_instance(pid).await.unwrap();
    assert_eq!(subs.len(), 2);
    assert!(subs
        .iter()
        .any(|s| s.event_name.as_deref() == Some("cancelIt")));

    rig.runtime.signal("cancelIt", None, None).await.unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);

    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Cancelled);

    let kinds = event_kinds(&rig.store, pid).await;
    assert_eq!(
        count_kind(&kinds, LifecycleEventType::ProcessInstanceEnd),
        1
    );
    assert_subsequence(
        &kinds,
        &[
            LifecycleEventType::SignalReceived,
            LifecycleEventType::TaskCancelled,
            LifecycleEventType::ProcessInstanceEnd,
        ],
    );
}

struct RecordingHandler {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ServiceTaskHandler for RecordingHandler {
    async fn execute(&self, _ctx: ServiceTaskContext) -> Result<HandlerOutcome> {
        self.log.lock().await.push(self.name.to_string());
        Ok(HandlerOutcome::Complete(Map::new()))
    }
}

fn transaction_definition() -> ProcessDefinition {
    DefinitionBuilder::new("booking")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("tx", ElementKind::Transaction))
        .element(
            Element::new("cancel_b", ElementKind::BoundaryEvent)
                .attached("tx")
                .with_event(EventDefinition::Cancel),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .element(Element::new("cancelled_end", ElementKind::EndEvent))
        .element(Element::new("tstart", ElementKind::StartEvent).in_container("tx"))
        .element(
            Element::new("t1", ElementKind::ServiceTask)
                .in_container("tx")
                .with_task_type("step1")
                .compensated_by("c1"),
        )
        .element(
            Element::new("t2", ElementKind::ServiceTask)
                .in_container("tx")
                .with_task_type("step2")
                .compensated_by("c2"),
        )
        .element(
            Element::new("cancel_end", ElementKind::EndEvent)
                .in_container("tx")
                .with_event(EventDefinition::Cancel),
        )
        .element(
            Element::new("c1", ElementKind::ServiceTask)
                .in_container("tx")
                .with_task_type("undo1"),
        )
        .element(
            Element::new("c2", ElementKind::ServiceTask)
                .in_container("tx")
                .with_task_type("undo2"),
        )
        .flow("f1", "start", "tx")
        .flow("f2", "tx", "end")
        .flow("f3", "cancel_b", "cancelled_end")
        .flow("t_f1", "tstart", "t1")
        .flow("t_f2", "t1", "t2")
        .flow("t_f3", "t2", "cancel_end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn transaction_cancel_compensates_lifo() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mk = |name: &'static str, log: &Arc<Mutex<Vec<String>>>| {
        Arc::new(RecordingHandler {
            name,
            log: log.clone(),
        }) as Arc<dyn ServiceTaskHandler>
    };
    let rig = rig_with_handlers(vec![
        ("step1", mk("do1", &log)),
        ("step2", mk("do2", &log)),
        ("undo1", mk("undo1", &log)),
        ("undo2", mk("undo2", &log)),
    ])
    .await;

    let def = rig.runtime.deploy(transaction_definition()).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    // Work ran forward, then compensated in reverse registration order.
    assert_eq!(*log.lock().await, vec!["do1", "do2", "undo2", "undo1"]);

    // The cancel boundary routed the flow to the cancelled end.
    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);

    let txs = rig.store.transactions().find_by_instance(pid).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].state, TransactionState::Cancelled);
    assert!(txs[0].compensation_subscriptions.is_empty());

    let kinds = event_kinds(&rig.store, pid).await;
    assert_eq!(
        count_kind(&kinds, LifecycleEventType::CompensationTriggered),
        2
    );
    assert_eq!(
        count_kind(&kinds, LifecycleEventType::TransactionCancelled),
        1
    );
}

#[tokio::test]
async fn completed_transaction_leaves_event_scope_for_late_throw() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mk = |name: &'static str, log: &Arc<Mutex<Vec<String>>>| {
        Arc::new(RecordingHandler {
            name,
            log: log.clone(),
        }) as Arc<dyn ServiceTaskHandler>
    };
    let rig = rig_with_handlers(vec![
        ("step1", mk("do1", &log)),
        ("undo1", mk("undo1", &log)),
    ])
    .await;

    // Same shape but the transaction runs to a plain end.
    let def = DefinitionBuilder::new("booking_ok")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("tx", ElementKind::Transaction))
        .element(Element::new("after", ElementKind::UserTask))
        .element(Element::new("end", ElementKind::EndEvent))
        .element(Element::new("tstart", ElementKind::StartEvent).in_container("tx"))
        .element(
            Element::new("t1", ElementKind::ServiceTask)
                .in_container("tx")
                .with_task_type("step1")
                .compensated_by("c1"),
        )
        .element(Element::new("tend", ElementKind::EndEvent).in_container("tx"))
        .element(
            Element::new("c1", ElementKind::ServiceTask)
                .in_container("tx")
                .with_task_type("undo1"),
        )
        .flow("f1", "start", "tx")
        .flow("f2", "tx", "after")
        .flow("f3", "after", "end")
        .flow("t_f1", "tstart", "t1")
        .flow("t_f2", "t1", "tend")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    // Transaction completed and converted to an event scope.
    let txs = rig.store.transactions().find_by_instance(pid).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].state, TransactionState::Completed);
    assert_eq!(txs[0].compensation_subscriptions.len(), 1);

    // A late explicit throw still reaches the handler.
    rig.runtime
        .trigger_compensation(pid, None)
        .await
        .unwrap();
    assert_eq!(*log.lock().await, vec!["do1", "undo1"]);

    let kinds = event_kinds(&rig.store, pid).await;
    assert_subsequence(
        &kinds,
        &[
            LifecycleEventType::TransactionCompleted,
            LifecycleEventType::CompensationTriggered,
        ],
    );
}

#[tokio::test]
async fn parallel_fork_and_join() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("fanout")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("fork", ElementKind::ParallelGateway))
        .element(
            Element::new("a", ElementKind::ScriptTask).with_script("1 + 1", "left"),
        )
        .element(
            Element::new("b", ElementKind::ScriptTask).with_script("2 + 2", "right"),
        )
        .element(Element::new("join", ElementKind::ParallelGateway))
        .element(Element::new("tail", ElementKind::UserTask))
        .element(Element::new("end", ElementKind::EndEvent))
        .flow("f1", "start", "fork")
        .flow("f2", "fork", "a")
        .flow("f3", "fork", "b")
        .flow("f4", "a", "join")
        .flow("f5", "b", "join")
        .flow("f6", "join", "tail")
        .flow("f7", "tail", "end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    // Both branches ran, the join released exactly one token.
    let vars = rig.runtime.variables(pid).await.unwrap();
    assert_eq!(vars.get("left"), Some(&json!(2)));
    assert_eq!(vars.get("right"), Some(&json!(4)));
    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);

    rig.runtime.complete_task(tasks[0].id, None).await.unwrap();
    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
}

#[tokio::test]
async fn error_boundary_catches_service_failure() {
    struct Failing;
    #[async_trait]
    impl ServiceTaskHandler for Failing {
        async fn execute(&self, _ctx: ServiceTaskContext) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::Error {
                code: "E_PAYMENT".into(),
                message: "card declined".into(),
            })
        }
    }
    let rig = rig_with_handlers(vec![("charge", Arc::new(Failing))]).await;
    let def = DefinitionBuilder::new("payment")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("charge", ElementKind::ServiceTask).with_task_type("charge"),
        )
        .element(
            Element::new("on_error", ElementKind::BoundaryEvent)
                .attached("charge")
                .with_event(EventDefinition::Error {
                    error_ref: Some("E_PAYMENT".into()),
                }),
        )
        .element(Element::new("end", ElementKind::EndEvent))
        .element(Element::new("declined_end", ElementKind::EndEvent))
        .flow("f1", "start", "charge")
        .flow("f2", "charge", "end")
        .flow("f3", "on_error", "declined_end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    let kinds = event_kinds(&rig.store, pid).await;
    assert_subsequence(
        &kinds,
        &[
            LifecycleEventType::ErrorThrown,
            LifecycleEventType::ErrorCaught,
            LifecycleEventType::ProcessInstanceEnd,
        ],
    );
}

#[tokio::test]
async fn uncaught_bpmn_error_fails_instance() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("throwing")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(
            Element::new("boom", ElementKind::EndEvent).with_event(EventDefinition::Error {
                error_ref: Some("E_FATAL".into()),
            }),
        )
        .flow("f1", "start", "boom")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Failed);
}

#[tokio::test]
async fn terminate_end_event_kills_siblings() {
    let rig = rig().await;
    let def = DefinitionBuilder::new("raceoff")
        .element(Element::new("start", ElementKind::StartEvent))
        .element(Element::new("fork", ElementKind::ParallelGateway))
        .element(Element::new("slow", ElementKind::UserTask))
        .element(
            Element::new("kill", ElementKind::EndEvent).with_event(EventDefinition::Terminate),
        )
        .element(Element::new("slow_end", ElementKind::EndEvent))
        .flow("f1", "start", "fork")
        .flow("f2", "fork", "slow")
        .flow("f3", "fork", "kill")
        .flow("f4", "slow", "slow_end")
        .build()
        .unwrap();
    let def = rig.runtime.deploy(def).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Terminated);
    let tasks = rig.runtime.tasks(pid).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Cancelled);
    assert!(rig
        .store
        .subscriptions()
        .find_by_instance(pid)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cancel_clears_runtime_rows() {
    let rig = rig().await;
    let def = rig.runtime.deploy(linear_definition()).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();

    rig.runtime
        .cancel(pid, Some("operator request".into()))
        .await
        .unwrap();

    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Cancelled);
    assert!(rig
        .store
        .executions()
        .find_by_instance(pid)
        .await
        .unwrap()
        .is_empty());
    assert!(rig
        .store
        .subscriptions()
        .find_by_instance(pid)
        .await
        .unwrap()
        .is_empty());

    // Cancelling twice is a state-machine conflict.
    let err = rig.runtime.cancel(pid, None).await.unwrap_err();
    assert!(matches!(
        err,
        flow_runtime_core::EngineError::Conflict(_)
    ));
}

#[tokio::test]
async fn suspend_blocks_and_resume_continues() {
    let rig = rig().await;
    let def = rig.runtime.deploy(linear_definition()).await.unwrap();
    let pid = rig
        .runtime
        .start_process(def.id, None, Map::new(), None)
        .await
        .unwrap();
    let task_id = rig.runtime.tasks(pid).await.unwrap()[0].id;

    rig.runtime.suspend(pid).await.unwrap();
    let err = rig.runtime.complete_task(task_id, None).await.unwrap_err();
    assert!(matches!(
        err,
        flow_runtime_core::EngineError::Conflict(_)
    ));

    rig.runtime.resume(pid).await.unwrap();
    rig.runtime.complete_task(task_id, None).await.unwrap();
    let instance = rig.runtime.instance(pid).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
}
