//! Durable event-subscription registry.
//!
//! One row per outstanding wait. Signals broadcast to every matching row;
//! messages, errors and compensations deliver to exactly one. Non-broadcast
//! creates replace the prior row for their `(instance, activity, type)` key.
//! Per-key delivery serialization falls out of the per-instance scheduler
//! lock — the registry itself never races with itself for one instance.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::model::{EventSubscription, EventType, SubscriptionConfig};
use crate::store::EngineStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct NewSubscription {
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub activity_id: String,
    pub event_type: EventType,
    pub event_name: Option<String>,
    pub config: SubscriptionConfig,
}

pub struct SubscriptionRegistry {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn EngineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a subscription. For instance-level rows this is an upsert on
    /// `(process_instance_id, activity_id, event_type)` — the prior row is
    /// replaced, which keeps the uniqueness invariant and re-asserts
    /// compensation registrations.
    pub async fn create(&self, new: NewSubscription) -> Result<EventSubscription> {
        if let Some(pid) = new.process_instance_id {
            if let Some(prior) = self
                .store
                .subscriptions()
                .find_by_key(pid, &new.activity_id, new.event_type)
                .await
                .map_err(|e| EngineError::SubscriptionCreateFailed(e.to_string()))?
            {
                self.store
                    .subscriptions()
                    .delete(prior.id)
                    .await
                    .map_err(|e| EngineError::SubscriptionCreateFailed(e.to_string()))?;
            }
        }
        let sub = EventSubscription {
            id: Uuid::now_v7(),
            process_instance_id: new.process_instance_id,
            execution_id: new.execution_id,
            activity_id: new.activity_id,
            event_type: new.event_type,
            event_name: new.event_name,
            config: new.config,
            create_time: self.clock.now(),
        };
        self.store
            .subscriptions()
            .save(&sub)
            .await
            .map_err(|e| EngineError::SubscriptionCreateFailed(e.to_string()))?;
        Ok(sub)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>> {
        self.store.subscriptions().find_by_id(id).await
    }

    pub async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<EventSubscription>> {
        self.store.subscriptions().find_by_instance(pid).await
    }

    /// Remove a single-fire subscription after delivery. Duplicate delivery
    /// of the same stimulus is absorbed here: the second delivery finds no
    /// row.
    pub async fn consume(&self, id: Uuid) -> Result<()> {
        self.store.subscriptions().delete(id).await
    }

    pub async fn delete_by_execution(&self, execution_id: Uuid) -> Result<()> {
        self.store
            .subscriptions()
            .delete_by_execution(execution_id)
            .await
    }

    pub async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        self.store.subscriptions().delete_by_instance(pid).await
    }

    /// Broadcast targets for a signal, optionally narrowed to one instance.
    pub async fn signal_targets(
        &self,
        signal_name: &str,
        pid: Option<Uuid>,
    ) -> Result<Vec<EventSubscription>> {
        let mut subs = self
            .store
            .subscriptions()
            .find_by_name_and_type(EventType::Signal, signal_name)
            .await?;
        if let Some(pid) = pid {
            subs.retain(|s| s.process_instance_id == Some(pid));
        }
        Ok(subs)
    }

    /// The single waiting execution a message is delivered to, if any.
    pub async fn message_target(
        &self,
        message_name: &str,
        correlation_key: Option<&str>,
    ) -> Result<Option<EventSubscription>> {
        let subs = self
            .store
            .subscriptions()
            .find_by_name_and_type(EventType::Message, message_name)
            .await?;
        match correlation_key {
            Some(key) => {
                // Correlate against the business key of the owning instance.
                for sub in subs {
                    if let Some(pid) = sub.process_instance_id {
                        let instance = self.store.instances().find_by_id(pid).await?;
                        if instance.and_then(|i| i.business_key).as_deref() == Some(key) {
                            return Ok(Some(sub));
                        }
                    }
                }
                Ok(None)
            }
            None => Ok(subs.into_iter().next()),
        }
    }

    pub async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventSubscription>> {
        self.store.subscriptions().find_due_timers(now, limit).await
    }

    /// Conditional subscriptions of one instance.
    pub async fn conditionals(&self, pid: Uuid) -> Result<Vec<EventSubscription>> {
        let subs = self.store.subscriptions().find_by_instance(pid).await?;
        Ok(subs
            .into_iter()
            .filter(|s| s.event_type == EventType::Conditional)
            .collect())
    }

    /// Persist a conditional's latest evaluation so firing happens only on
    /// the false→true transition.
    pub async fn record_conditional_value(
        &self,
        sub: &EventSubscription,
        value: bool,
    ) -> Result<()> {
        let mut updated = sub.clone();
        if let SubscriptionConfig::Conditional { expression, .. } = &sub.config {
            updated.config = SubscriptionConfig::Conditional {
                expression: expression.clone(),
                last_value: value,
            };
            self.store.subscriptions().update(&updated).await?;
        }
        Ok(())
    }

    /// Definition-level start-event subscriptions (signal/message starts).
    pub async fn start_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>> {
        self.store
            .subscriptions()
            .find_start_subscriptions(event_type, event_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store_memory::MemoryStore;

    fn registry() -> (SubscriptionRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_epoch());
        (
            SubscriptionRegistry::new(store.clone() as Arc<dyn EngineStore>, clock),
            store,
        )
    }

    fn signal_sub(pid: Uuid, activity: &str, name: &str) -> NewSubscription {
        NewSubscription {
            process_instance_id: Some(pid),
            execution_id: Some(Uuid::now_v7()),
            activity_id: activity.to_string(),
            event_type: EventType::Signal,
            event_name: Some(name.to_string()),
            config: SubscriptionConfig::None,
        }
    }

    #[tokio::test]
    async fn create_replaces_prior_row_per_key() {
        let (reg, store) = registry();
        let pid = Uuid::now_v7();
        let first = reg.create(signal_sub(pid, "catch", "go")).await.unwrap();
        let second = reg.create(signal_sub(pid, "catch", "go")).await.unwrap();
        assert_ne!(first.id, second.id);

        let all = store.subscriptions().find_by_instance(pid).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, second.id);
    }

    #[tokio::test]
    async fn signal_broadcast_spans_instances() {
        let (reg, _) = registry();
        let pid_a = Uuid::now_v7();
        let pid_b = Uuid::now_v7();
        reg.create(signal_sub(pid_a, "a", "go")).await.unwrap();
        reg.create(signal_sub(pid_b, "b", "go")).await.unwrap();
        reg.create(signal_sub(pid_b, "c", "other")).await.unwrap();

        assert_eq!(reg.signal_targets("go", None).await.unwrap().len(), 2);
        assert_eq!(
            reg.signal_targets("go", Some(pid_b)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn consume_absorbs_duplicate_delivery() {
        let (reg, _) = registry();
        let pid = Uuid::now_v7();
        let sub = reg.create(signal_sub(pid, "catch", "go")).await.unwrap();
        reg.consume(sub.id).await.unwrap();
        reg.consume(sub.id).await.unwrap();
        assert!(reg.signal_targets("go", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_timers_ordered_and_limited() {
        let (reg, _) = registry();
        let pid = Uuid::now_v7();
        let base = chrono::Utc::now();
        for (activity, offset) in [("t1", 30), ("t2", 10), ("t3", 20)] {
            reg.create(NewSubscription {
                process_instance_id: Some(pid),
                execution_id: Some(Uuid::now_v7()),
                activity_id: activity.to_string(),
                event_type: EventType::Timer,
                event_name: None,
                config: SubscriptionConfig::Timer {
                    due: base + chrono::Duration::seconds(offset),
                    cycle: None,
                },
            })
            .await
            .unwrap();
        }
        let due = reg
            .due_timers(base + chrono::Duration::seconds(25), 10)
            .await
            .unwrap();
        let order: Vec<&str> = due.iter().map(|s| s.activity_id.as_str()).collect();
        assert_eq!(order, vec!["t2", "t3"]);
    }
}
