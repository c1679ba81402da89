//! Transaction sub-process lifecycle and compensation replay.
//!
//! A transaction scope accumulates compensation subscriptions as activities
//! inside it complete. Successful completion retires the scope into an
//! event scope (fresh id, same subscription list) so later compensation
//! throws can still find handlers. Cancellation either replays handlers in
//! reverse registration order and clears them (cancel end event), or leaves
//! them untouched for a later explicit throw (boundary cancel).

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::model::{
    EventSubscription, EventType, SubscriptionConfig, TransactionScope, TransactionState,
};
use crate::outbox::{LifecycleEventType, OutboxEvent};
use crate::store::EngineStore;
use crate::subscription::{NewSubscription, SubscriptionRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Executes one compensation handler activity. Implemented by the
/// interpreter; the manager only decides order and bookkeeping.
#[async_trait]
pub trait CompensationInvoker: Send + Sync {
    async fn invoke_handler(
        &self,
        process_instance_id: Uuid,
        handler_activity_id: &str,
        compensated_activity_id: &str,
    ) -> Result<()>;
}

pub struct TransactionManager {
    store: Arc<dyn EngineStore>,
    registry: Arc<SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
}

impl TransactionManager {
    pub fn new(
        store: Arc<dyn EngineStore>,
        registry: Arc<SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Open a transaction scope for a transaction sub-process entry.
    pub async fn open(
        &self,
        process_instance_id: Uuid,
        execution_id: Option<Uuid>,
        scope_id: Uuid,
        element_id: &str,
    ) -> Result<TransactionScope> {
        let tx = TransactionScope {
            id: Uuid::now_v7(),
            process_instance_id,
            execution_id,
            scope_id,
            element_id: element_id.to_string(),
            state: TransactionState::Active,
            compensation_subscriptions: Vec::new(),
            create_time: self.clock.now(),
            complete_time: None,
        };
        self.store.transactions().save(&tx).await?;
        Ok(tx)
    }

    pub async fn find(&self, tx_id: Uuid) -> Result<TransactionScope> {
        self.store
            .transactions()
            .find_by_id(tx_id)
            .await?
            .ok_or_else(|| EngineError::not_found("transaction scope", tx_id))
    }

    /// Register (or re-assert) the compensation handler for an activity that
    /// completed inside the transaction. Latest registration wins; append
    /// order is preserved for LIFO replay.
    pub async fn add_compensation_subscription(
        &self,
        tx_id: Uuid,
        activity_id: &str,
        handler_activity_id: &str,
    ) -> Result<EventSubscription> {
        let mut tx = self.find(tx_id).await?;
        if tx.state != TransactionState::Active {
            return Err(EngineError::conflict(format!(
                "transaction {tx_id} is not active"
            )));
        }

        // The registry upsert drops the prior row; mirror that in the list.
        let prior: Vec<Uuid> = {
            let mut prior = Vec::new();
            for id in &tx.compensation_subscriptions {
                if let Some(sub) = self.registry.find_by_id(*id).await? {
                    if sub.activity_id == activity_id {
                        prior.push(*id);
                    }
                }
            }
            prior
        };
        // Compensation subscriptions outlive the executions that created
        // them (the event scope serves throws long after the activity is
        // gone), so they are never keyed to an execution.
        let sub = self
            .registry
            .create(NewSubscription {
                process_instance_id: Some(tx.process_instance_id),
                execution_id: None,
                activity_id: activity_id.to_string(),
                event_type: EventType::Compensation,
                event_name: None,
                config: SubscriptionConfig::Compensation {
                    handler_activity_id: handler_activity_id.to_string(),
                    transaction_scope_id: Some(tx_id),
                },
            })
            .await?;
        tx.compensation_subscriptions.retain(|id| !prior.contains(id));
        tx.compensation_subscriptions.push(sub.id);
        self.store.transactions().update(&tx).await?;
        Ok(sub)
    }

    pub async fn remove_compensation_subscription(
        &self,
        tx_id: Uuid,
        activity_id: &str,
    ) -> Result<()> {
        let mut tx = self.find(tx_id).await?;
        let mut removed = Vec::new();
        for id in &tx.compensation_subscriptions {
            if let Some(sub) = self.registry.find_by_id(*id).await? {
                if sub.activity_id == activity_id {
                    self.registry.consume(*id).await?;
                    removed.push(*id);
                }
            }
        }
        tx.compensation_subscriptions.retain(|id| !removed.contains(id));
        self.store.transactions().update(&tx).await
    }

    /// Replay compensation handlers in reverse registration order,
    /// restricted to `activity_ids` when given. Handler failure is logged,
    /// emitted, and does not abort the remaining replays. Replayed
    /// subscriptions are cleared; the scope returns to its prior state.
    pub async fn trigger_compensation(
        &self,
        tx_id: Uuid,
        activity_ids: Option<&[String]>,
        invoker: &dyn CompensationInvoker,
    ) -> Result<usize> {
        let mut tx = self.find(tx_id).await?;
        let prior_state = tx.state;
        tx.state = TransactionState::Compensating;
        self.store.transactions().update(&tx).await?;

        let mut replayed = Vec::new();
        let mut count = 0;
        for sub_id in tx.compensation_subscriptions.iter().rev() {
            let sub = match self.registry.find_by_id(*sub_id).await? {
                Some(sub) => sub,
                None => continue,
            };
            if let Some(wanted) = activity_ids {
                if !wanted.iter().any(|a| a == &sub.activity_id) {
                    continue;
                }
            }
            let handler = match &sub.config {
                SubscriptionConfig::Compensation {
                    handler_activity_id,
                    ..
                } => handler_activity_id.clone(),
                _ => continue,
            };

            let now = self.clock.now();
            self.store
                .outbox()
                .append(
                    &OutboxEvent::new(LifecycleEventType::CompensationTriggered, now)
                        .instance(tx.process_instance_id)
                        .activity(sub.activity_id.clone())
                        .payload(serde_json::json!({ "handler": handler })),
                )
                .await?;

            match invoker
                .invoke_handler(tx.process_instance_id, &handler, &sub.activity_id)
                .await
            {
                Ok(()) => count += 1,
                Err(e) => {
                    // Best effort: keep replaying the rest.
                    tracing::warn!(
                        activity = %sub.activity_id,
                        handler = %handler,
                        error = %e,
                        "compensation handler failed"
                    );
                    self.store
                        .outbox()
                        .append(
                            &OutboxEvent::new(
                                LifecycleEventType::CompensationFailed,
                                self.clock.now(),
                            )
                            .instance(tx.process_instance_id)
                            .activity(sub.activity_id.clone())
                            .payload(serde_json::json!({
                                "handler": handler,
                                "error": e.to_string(),
                            })),
                        )
                        .await?;
                }
            }
            self.registry.consume(sub.id).await?;
            replayed.push(sub.id);
        }

        let mut tx = self.find(tx_id).await?;
        tx.compensation_subscriptions.retain(|id| !replayed.contains(id));
        tx.state = prior_state;
        self.store.transactions().update(&tx).await?;
        Ok(count)
    }

    /// Successful completion: retire the active scope and replace it with
    /// an event-scope row (new id, `Completed`, same subscription list).
    pub async fn convert_to_event_scope(&self, tx_id: Uuid) -> Result<TransactionScope> {
        let tx = self.find(tx_id).await?;
        if tx.state != TransactionState::Active {
            return Err(EngineError::conflict(format!(
                "transaction {tx_id} cannot complete from {:?}",
                tx.state
            )));
        }
        let now = self.clock.now();
        let event_scope = TransactionScope {
            id: Uuid::now_v7(),
            state: TransactionState::Completed,
            complete_time: Some(now),
            ..tx.clone()
        };
        self.store.transactions().save(&event_scope).await?;
        self.store.transactions().delete(tx.id).await?;

        // Re-point retained subscriptions at the event scope.
        for sub_id in &event_scope.compensation_subscriptions {
            if let Some(mut sub) = self.registry.find_by_id(*sub_id).await? {
                if let SubscriptionConfig::Compensation {
                    handler_activity_id,
                    ..
                } = &sub.config
                {
                    sub.config = SubscriptionConfig::Compensation {
                        handler_activity_id: handler_activity_id.clone(),
                        transaction_scope_id: Some(event_scope.id),
                    };
                    self.store.subscriptions().update(&sub).await?;
                }
            }
        }

        self.store
            .outbox()
            .append(
                &OutboxEvent::new(LifecycleEventType::TransactionCompleted, now)
                    .instance(tx.process_instance_id)
                    .activity(tx.element_id.clone())
                    .payload(serde_json::json!({ "event_scope_id": event_scope.id })),
            )
            .await?;
        Ok(event_scope)
    }

    /// Cancel the transaction. `trigger_compensation = true` (cancel end
    /// event) replays handlers LIFO and clears the subscriptions;
    /// `false` (boundary cancel) leaves them intact for later explicit
    /// compensation throws.
    pub async fn cancel(
        &self,
        tx_id: Uuid,
        trigger_compensation: bool,
        invoker: &dyn CompensationInvoker,
    ) -> Result<TransactionScope> {
        let tx = self.find(tx_id).await?;
        if matches!(tx.state, TransactionState::Cancelled) {
            return Err(EngineError::conflict(format!(
                "transaction {tx_id} already cancelled"
            )));
        }

        if trigger_compensation {
            self.trigger_compensation(tx_id, None, invoker).await?;
        }

        let mut tx = self.find(tx_id).await?;
        tx.state = TransactionState::Cancelled;
        tx.complete_time = Some(self.clock.now());
        self.store.transactions().update(&tx).await?;

        self.store
            .outbox()
            .append(
                &OutboxEvent::new(LifecycleEventType::TransactionCancelled, self.clock.now())
                    .instance(tx.process_instance_id)
                    .activity(tx.element_id.clone())
                    .payload(serde_json::json!({ "compensated": trigger_compensation })),
            )
            .await?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store_memory::MemoryStore;
    use tokio::sync::Mutex;

    struct RecordingInvoker {
        invoked: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl RecordingInvoker {
        fn new() -> Self {
            Self {
                invoked: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl CompensationInvoker for RecordingInvoker {
        async fn invoke_handler(
            &self,
            _pid: Uuid,
            handler: &str,
            _compensated: &str,
        ) -> Result<()> {
            self.invoked.lock().await.push(handler.to_string());
            if self.fail_on.as_deref() == Some(handler) {
                return Err(EngineError::Internal("handler exploded".into()));
            }
            Ok(())
        }
    }

    async fn setup() -> (TransactionManager, Arc<MemoryStore>, TransactionScope) {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(ManualClock::at_epoch());
        let registry = Arc::new(SubscriptionRegistry::new(
            store.clone() as Arc<dyn EngineStore>,
            clock.clone(),
        ));
        let mgr = TransactionManager::new(
            store.clone() as Arc<dyn EngineStore>,
            registry,
            clock,
        );
        let tx = mgr
            .open(Uuid::now_v7(), None, Uuid::now_v7(), "tx")
            .await
            .unwrap();
        (mgr, store, tx)
    }

    #[tokio::test]
    async fn replay_is_lifo() {
        let (mgr, _, tx) = setup().await;
        mgr.add_compensation_subscription(tx.id, "t1", "c1")
            .await
            .unwrap();
        mgr.add_compensation_subscription(tx.id, "t2", "c2")
            .await
            .unwrap();
        mgr.add_compensation_subscription(tx.id, "t3", "c3")
            .await
            .unwrap();

        let invoker = RecordingInvoker::new();
        let count = mgr
            .trigger_compensation(tx.id, None, &invoker)
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(*invoker.invoked.lock().await, vec!["c3", "c2", "c1"]);
    }

    #[tokio::test]
    async fn reregistration_wins_and_keeps_single_entry() {
        let (mgr, _, tx) = setup().await;
        mgr.add_compensation_subscription(tx.id, "t1", "old_handler")
            .await
            .unwrap();
        mgr.add_compensation_subscription(tx.id, "t2", "c2")
            .await
            .unwrap();
        mgr.add_compensation_subscription(tx.id, "t1", "new_handler")
            .await
            .unwrap();

        let invoker = RecordingInvoker::new();
        mgr.trigger_compensation(tx.id, None, &invoker)
            .await
            .unwrap();
        // t1 re-registered after t2, so it replays first, with the new handler.
        assert_eq!(*invoker.invoked.lock().await, vec!["new_handler", "c2"]);
    }

    #[tokio::test]
    async fn add_then_remove_is_identity() {
        let (mgr, _, tx) = setup().await;
        mgr.add_compensation_subscription(tx.id, "t1", "c1")
            .await
            .unwrap();
        let before = mgr.find(tx.id).await.unwrap().compensation_subscriptions;
        mgr.add_compensation_subscription(tx.id, "t2", "c2")
            .await
            .unwrap();
        mgr.remove_compensation_subscription(tx.id, "t2")
            .await
            .unwrap();
        let after = mgr.find(tx.id).await.unwrap().compensation_subscriptions;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_replay() {
        let (mgr, store, tx) = setup().await;
        let pid = tx.process_instance_id;
        mgr.add_compensation_subscription(tx.id, "t1", "c1")
            .await
            .unwrap();
        mgr.add_compensation_subscription(tx.id, "t2", "c2")
            .await
            .unwrap();

        let invoker = RecordingInvoker {
            invoked: Mutex::new(Vec::new()),
            fail_on: Some("c2".to_string()),
        };
        let count = mgr
            .trigger_compensation(tx.id, None, &invoker)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(*invoker.invoked.lock().await, vec!["c2", "c1"]);

        let events = store.outbox().find_by_instance(pid).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&LifecycleEventType::CompensationFailed));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == LifecycleEventType::CompensationTriggered)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn complete_converts_to_event_scope() {
        let (mgr, _, tx) = setup().await;
        mgr.add_compensation_subscription(tx.id, "t1", "c1")
            .await
            .unwrap();
        let event_scope = mgr.convert_to_event_scope(tx.id).await.unwrap();
        assert_ne!(event_scope.id, tx.id);
        assert_eq!(event_scope.state, TransactionState::Completed);
        assert_eq!(event_scope.compensation_subscriptions.len(), 1);
        // Old row is gone; a late throw still finds handlers via the new id.
        assert!(mgr.find(tx.id).await.is_err());

        let invoker = RecordingInvoker::new();
        let count = mgr
            .trigger_compensation(event_scope.id, None, &invoker)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let after = mgr.find(event_scope.id).await.unwrap();
        assert!(after.compensation_subscriptions.is_empty());
    }

    #[tokio::test]
    async fn cancel_paths_follow_decision_table() {
        // Cancel end event: compensate then clear.
        let (mgr, _, tx) = setup().await;
        mgr.add_compensation_subscription(tx.id, "t1", "c1")
            .await
            .unwrap();
        let invoker = RecordingInvoker::new();
        let cancelled = mgr.cancel(tx.id, true, &invoker).await.unwrap();
        assert_eq!(cancelled.state, TransactionState::Cancelled);
        assert!(cancelled.compensation_subscriptions.is_empty());
        assert_eq!(*invoker.invoked.lock().await, vec!["c1"]);

        // Boundary cancel: no compensation, subscriptions retained.
        let (mgr, _, tx) = setup().await;
        mgr.add_compensation_subscription(tx.id, "t1", "c1")
            .await
            .unwrap();
        let invoker = RecordingInvoker::new();
        let cancelled = mgr.cancel(tx.id, false, &invoker).await.unwrap();
        assert_eq!(cancelled.state, TransactionState::Cancelled);
        assert_eq!(cancelled.compensation_subscriptions.len(), 1);
        assert!(invoker.invoked.lock().await.is_empty());

        // Double cancel is a conflict.
        let err = mgr.cancel(tx.id, false, &invoker).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
