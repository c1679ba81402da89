//! Transactional lifecycle-event outbox.
//!
//! Every significant state change appends exactly one row inside the same
//! store transaction that mutated core state. Background loops drain the
//! rows to the event bus at-least-once: the publisher ticks at a fixed
//! interval, a retry sweep resets failed rows below their retry budget, and
//! a janitor deletes processed rows past retention. Consumers dedup by row
//! id.

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::store::EngineStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

// ─── Event kinds and topics ───────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEventType {
    ProcessInstanceStart,
    ProcessInstanceEnd,
    ProcessInstanceCancelled,
    ProcessInstanceSuspended,
    ProcessInstanceResumed,
    ActivityStarted,
    ActivityCompleted,
    ActivityCancelled,
    TaskCreated,
    TaskClaimed,
    TaskCompleted,
    TaskCancelled,
    VariableCreated,
    VariableUpdated,
    SignalReceived,
    MessageReceived,
    TimerFired,
    ErrorThrown,
    ErrorCaught,
    CompensationTriggered,
    CompensationFailed,
    TransactionCompleted,
    TransactionCancelled,
    IncidentRaised,
    IncidentResolved,
    Custom,
    /// Forward-compat: rows written by a newer engine version.
    #[serde(other)]
    Unknown,
}

impl LifecycleEventType {
    /// Static topic map. `Custom` derives its topic from the row's
    /// `event_code`; anything unrecognized lands on `event.unknown`.
    pub fn topic(&self, event_code: Option<&str>) -> String {
        match self {
            LifecycleEventType::ProcessInstanceStart => "process.instance.start".into(),
            LifecycleEventType::ProcessInstanceEnd => "process.instance.end".into(),
            LifecycleEventType::ProcessInstanceCancelled => "process.instance.cancelled".into(),
            LifecycleEventType::ProcessInstanceSuspended => "process.instance.suspended".into(),
            LifecycleEventType::ProcessInstanceResumed => "process.instance.resumed".into(),
            LifecycleEventType::ActivityStarted => "activity.started".into(),
            LifecycleEventType::ActivityCompleted => "activity.completed".into(),
            LifecycleEventType::ActivityCancelled => "activity.cancelled".into(),
            LifecycleEventType::TaskCreated => "task.created".into(),
            LifecycleEventType::TaskClaimed => "task.claimed".into(),
            LifecycleEventType::TaskCompleted => "task.completed".into(),
            LifecycleEventType::TaskCancelled => "task.cancelled".into(),
            LifecycleEventType::VariableCreated => "variable.created".into(),
            LifecycleEventType::VariableUpdated => "variable.updated".into(),
            LifecycleEventType::SignalReceived => "signal.received".into(),
            LifecycleEventType::MessageReceived => "message.received".into(),
            LifecycleEventType::TimerFired => "timer.fired".into(),
            LifecycleEventType::ErrorThrown => "error.thrown".into(),
            LifecycleEventType::ErrorCaught => "error.caught".into(),
            LifecycleEventType::CompensationTriggered => "compensation.triggered".into(),
            LifecycleEventType::CompensationFailed => "compensation.failed".into(),
            LifecycleEventType::TransactionCompleted => "transaction.completed".into(),
            LifecycleEventType::TransactionCancelled => "transaction.cancelled".into(),
            LifecycleEventType::IncidentRaised => "incident.raised".into(),
            LifecycleEventType::IncidentResolved => "incident.resolved".into(),
            LifecycleEventType::Custom => match event_code {
                Some(code) => format!("custom.{code}"),
                None => "event.unknown".into(),
            },
            LifecycleEventType::Unknown => "event.unknown".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Processed,
    Failed,
}

// ─── Outbox row ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: LifecycleEventType,
    /// Topic suffix for `Custom` events.
    pub event_code: Option<String>,
    pub status: OutboxStatus,
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub activity_id: Option<String>,
    pub task_id: Option<Uuid>,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub processed_time: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(event_type: LifecycleEventType, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            event_code: None,
            status: OutboxStatus::Pending,
            process_instance_id: None,
            execution_id: None,
            activity_id: None,
            task_id: None,
            payload: Value::Null,
            retry_count: 0,
            max_retries: 5,
            error_message: None,
            create_time: at,
            update_time: at,
            processed_time: None,
        }
    }

    pub fn instance(mut self, pid: Uuid) -> Self {
        self.process_instance_id = Some(pid);
        self
    }

    pub fn execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.event_code = Some(code.into());
        self
    }

    pub fn topic(&self) -> String {
        self.event_type.topic(self.event_code.as_deref())
    }
}

// ─── Publisher ────────────────────────────────────────────────

/// Drains pending outbox rows to the bus. One instance per runtime; each of
/// the three loops runs in its own task with a shared shutdown channel.
pub struct OutboxPublisher {
    store: Arc<dyn EngineStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn EngineStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
        }
    }

    /// Publisher loop: tick until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("outbox publisher started");
        loop {
            if *shutdown.borrow() {
                tracing::info!("outbox publisher shutting down");
                break;
            }
            match self.publish_batch().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(published = n, "outbox batch drained"),
                Err(e) => tracing::error!(error = %e, "outbox publish tick failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.outbox_poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One publisher tick: select up to the batch size of PENDING rows in
    /// `create_time ASC` order, publish each, flip status. Returns how many
    /// rows were published successfully.
    pub async fn publish_batch(&self) -> Result<usize> {
        let pending = self
            .store
            .outbox()
            .find_by_status(OutboxStatus::Pending, self.config.outbox_batch_size)
            .await?;
        let mut published = 0;
        for mut event in pending {
            let topic = event.topic();
            match self.bus.publish(&topic, &event).await {
                Ok(()) => {
                    event.status = OutboxStatus::Published;
                    event.update_time = self.clock.now();
                    self.store.outbox().update(&event).await?;
                    published += 1;
                }
                Err(e) => {
                    tracing::warn!(event_id = %event.id, topic = %topic, error = %e, "outbox publish failed");
                    event.status = OutboxStatus::Failed;
                    event.retry_count += 1;
                    event.error_message = Some(e.to_string());
                    event.update_time = self.clock.now();
                    self.store.outbox().update(&event).await?;
                }
            }
        }
        Ok(published)
    }

    /// Retry loop: every `outbox_retry_interval`, reset FAILED rows below
    /// their retry budget back to PENDING.
    pub async fn run_retry_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.retry_failed().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(reset = n, "failed outbox rows re-queued"),
                Err(e) => tracing::error!(error = %e, "outbox retry sweep failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.outbox_retry_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One retry sweep. Rows at their retry budget stay FAILED (dead-letter).
    pub async fn retry_failed(&self) -> Result<usize> {
        let failed = self
            .store
            .outbox()
            .find_by_status(OutboxStatus::Failed, self.config.outbox_batch_size)
            .await?;
        let mut reset = 0;
        for mut event in failed {
            if event.retry_count >= event.max_retries {
                continue;
            }
            event.status = OutboxStatus::Pending;
            event.update_time = self.clock.now();
            self.store.outbox().update(&event).await?;
            reset += 1;
        }
        Ok(reset)
    }

    /// Janitor loop: delete PROCESSED rows older than the retention window.
    pub async fn run_janitor(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(24 * 3600);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.purge_processed().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(purged = n, "processed outbox rows purged"),
                Err(e) => tracing::error!(error = %e, "outbox janitor failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    pub async fn purge_processed(&self) -> Result<usize> {
        let cutoff =
            self.clock.now() - chrono::Duration::days(self.config.outbox_retention_days);
        self.store
            .outbox()
            .delete_processed_before(cutoff)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_map() {
        assert_eq!(
            LifecycleEventType::ProcessInstanceStart.topic(None),
            "process.instance.start"
        );
        assert_eq!(
            LifecycleEventType::CompensationTriggered.topic(None),
            "compensation.triggered"
        );
        assert_eq!(
            LifecycleEventType::Custom.topic(Some("order_shipped")),
            "custom.order_shipped"
        );
        assert_eq!(LifecycleEventType::Custom.topic(None), "event.unknown");
        assert_eq!(LifecycleEventType::Unknown.topic(None), "event.unknown");
    }

    #[test]
    fn unknown_event_type_deserializes() {
        let parsed: LifecycleEventType =
            serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(parsed, LifecycleEventType::Unknown);
    }
}
