//! History projections — write-only mirrors of process/activity/task
//! transitions, derived from the outbox stream.
//!
//! The projector is a bus subscriber: it folds published lifecycle events
//! into history rows and marks each consumed row PROCESSED, which is what
//! makes the row eligible for the janitor.

use crate::bus::EventSubscriber;
use crate::clock::Clock;
use crate::error::Result;
use crate::outbox::{LifecycleEventType, OutboxEvent, OutboxStatus};
use crate::store::EngineStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoricProcessInstance {
    pub process_instance_id: Uuid,
    pub definition_id: Option<Uuid>,
    pub business_key: Option<String>,
    pub state: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoricActivity {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub element_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoricTask {
    pub task_id: Uuid,
    pub process_instance_id: Uuid,
    pub element_id: Option<String>,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub state: String,
    pub create_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

/// Bus subscriber feeding the history tables.
pub struct HistoryProjector {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
}

impl HistoryProjector {
    pub fn new(store: Arc<dyn EngineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn mark_processed(&self, event: &OutboxEvent) -> Result<()> {
        if let Some(mut row) = self.store.outbox().find_by_id(event.id).await? {
            row.status = OutboxStatus::Processed;
            row.processed_time = Some(self.clock.now());
            row.update_time = row.processed_time.unwrap();
            self.store.outbox().update(&row).await?;
        }
        Ok(())
    }

    fn payload_str(event: &OutboxEvent, key: &str) -> Option<String> {
        event
            .payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl EventSubscriber for HistoryProjector {
    async fn on_event(&self, _topic: &str, event: &OutboxEvent) -> Result<()> {
        let pid = match event.process_instance_id {
            Some(pid) => pid,
            None => return self.mark_processed(event).await,
        };

        match event.event_type {
            LifecycleEventType::ProcessInstanceStart => {
                let record = HistoricProcessInstance {
                    process_instance_id: pid,
                    definition_id: Self::payload_str(event, "definition_id")
                        .and_then(|s| s.parse().ok()),
                    business_key: Self::payload_str(event, "business_key"),
                    state: "ACTIVE".to_string(),
                    start_time: event.create_time,
                    end_time: None,
                };
                self.store.history().save_process(&record).await?;
            }
            LifecycleEventType::ProcessInstanceEnd
            | LifecycleEventType::ProcessInstanceCancelled => {
                if let Some(mut record) = self.store.history().find_process(pid).await? {
                    record.state = Self::payload_str(event, "state")
                        .unwrap_or_else(|| "COMPLETED".to_string());
                    record.end_time = Some(event.create_time);
                    self.store.history().save_process(&record).await?;
                }
            }
            LifecycleEventType::ActivityStarted => {
                let record = HistoricActivity {
                    id: event.id,
                    process_instance_id: pid,
                    execution_id: event.execution_id,
                    element_id: event.activity_id.clone().unwrap_or_default(),
                    start_time: event.create_time,
                    end_time: None,
                };
                self.store.history().save_activity(&record).await?;
            }
            LifecycleEventType::ActivityCompleted | LifecycleEventType::ActivityCancelled => {
                let open = self
                    .store
                    .history()
                    .find_activities(pid)
                    .await?
                    .into_iter()
                    .find(|a| {
                        a.end_time.is_none()
                            && Some(a.element_id.as_str()) == event.activity_id.as_deref()
                    });
                if let Some(mut record) = open {
                    record.end_time = Some(event.create_time);
                    self.store.history().save_activity(&record).await?;
                }
            }
            LifecycleEventType::TaskCreated => {
                if let Some(task_id) = event.task_id {
                    let record = HistoricTask {
                        task_id,
                        process_instance_id: pid,
                        element_id: event.activity_id.clone(),
                        name: Self::payload_str(event, "name"),
                        assignee: Self::payload_str(event, "assignee"),
                        state: "CREATED".to_string(),
                        create_time: event.create_time,
                        complete_time: None,
                    };
                    self.store.history().save_task(&record).await?;
                }
            }
            LifecycleEventType::TaskClaimed
            | LifecycleEventType::TaskCompleted
            | LifecycleEventType::TaskCancelled => {
                if let Some(task_id) = event.task_id {
                    let existing = self
                        .store
                        .history()
                        .find_tasks(pid)
                        .await?
                        .into_iter()
                        .find(|t| t.task_id == task_id);
                    if let Some(mut record) = existing {
                        match event.event_type {
                            LifecycleEventType::TaskClaimed => {
                                record.state = "CLAIMED".to_string();
                                record.assignee = Self::payload_str(event, "assignee");
                            }
                            LifecycleEventType::TaskCompleted => {
                                record.state = "COMPLETED".to_string();
                                record.complete_time = Some(event.create_time);
                            }
                            _ => {
                                record.state = "CANCELLED".to_string();
                                record.complete_time = Some(event.create_time);
                            }
                        }
                        self.store.history().save_task(&record).await?;
                    }
                }
            }
            _ => {}
        }

        self.mark_processed(event).await
    }
}
