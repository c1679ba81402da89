//! Shared fixture for the engine scenario tests: in-memory store, manual
//! clock, in-process bus.

use flow_runtime_core::bus::InMemoryBus;
use flow_runtime_core::clock::ManualClock;
use flow_runtime_core::handler::ServiceTaskHandler;
use flow_runtime_core::outbox::LifecycleEventType;
use flow_runtime_core::runtime::ProcessRuntime;
use flow_runtime_core::store::EngineStore;
use flow_runtime_core::store_memory::MemoryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub struct TestRig {
    pub runtime: Arc<ProcessRuntime>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

/// Honor RUST_LOG when debugging a scenario; no-op after the first call.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn rig() -> TestRig {
    rig_with_handlers(Vec::new()).await
}

pub async fn rig_with_handlers(
    handlers: Vec<(&'static str, Arc<dyn ServiceTaskHandler>)>,
) -> TestRig {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let mut builder = ProcessRuntime::builder(store.clone() as Arc<dyn EngineStore>)
        .bus(Arc::new(InMemoryBus::new()))
        .clock(clock.clone());
    for (task_type, handler) in handlers {
        builder = builder.handler(task_type, handler);
    }
    let runtime = builder.build().await;
    TestRig {
        runtime,
        store,
        clock,
    }
}

/// The instance's outbox event kinds, in append order.
pub async fn event_kinds(store: &Arc<MemoryStore>, pid: Uuid) -> Vec<LifecycleEventType> {
    store
        .outbox()
        .find_by_instance(pid)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Assert `wanted` appears as an ordered subsequence of `kinds`.
pub fn assert_subsequence(kinds: &[LifecycleEventType], wanted: &[LifecycleEventType]) {
    let mut cursor = 0;
    for kind in kinds {
        if cursor < wanted.len() && *kind == wanted[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(
        cursor,
        wanted.len(),
        "expected {wanted:?} in order within {kinds:?}"
    );
}

pub fn count_kind(kinds: &[LifecycleEventType], wanted: LifecycleEventType) -> usize {
    kinds.iter().filter(|k| **k == wanted).count()
}
