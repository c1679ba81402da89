//! Publish/subscribe surface the outbox drains into. The in-process bus is
//! the default; external brokers plug in behind the same trait.

use crate::error::{EngineError, Result};
use crate::outbox::OutboxEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, topic: &str, event: &OutboxEvent) -> Result<()>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver an event to every subscriber matching `topic`. Any subscriber
    /// failure fails the publish (the outbox will retry the row).
    async fn publish(&self, topic: &str, event: &OutboxEvent) -> Result<()>;

    /// Register a subscriber for a topic prefix. `"*"` subscribes to all
    /// topics; otherwise matching is exact or on `.`-separated prefixes
    /// (`"task"` matches `task.created`).
    async fn subscribe(&self, topic_prefix: &str, subscriber: Arc<dyn EventSubscriber>);
}

fn prefix_matches(prefix: &str, topic: &str) -> bool {
    prefix == "*" || topic == prefix || topic.starts_with(&format!("{prefix}."))
}

/// In-process bus backed by a subscriber registry.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: RwLock<Vec<(String, Arc<dyn EventSubscriber>)>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &str, event: &OutboxEvent) -> Result<()> {
        let subscribers: Vec<Arc<dyn EventSubscriber>> = {
            let r = self.subscribers.read().await;
            r.iter()
                .filter(|(prefix, _)| prefix_matches(prefix, topic))
                .map(|(_, s)| s.clone())
                .collect()
        };
        for subscriber in subscribers {
            subscriber
                .on_event(topic, event)
                .await
                .map_err(|e| EngineError::OutboxPublishFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic_prefix: &str, subscriber: Arc<dyn EventSubscriber>) {
        let mut w = self.subscribers.write().await;
        w.push((topic_prefix.to_string(), subscriber));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::LifecycleEventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventSubscriber for Counter {
        async fn on_event(&self, _topic: &str, _event: &OutboxEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn prefix_routing() {
        let bus = InMemoryBus::new();
        let all = Arc::new(Counter(AtomicUsize::new(0)));
        let tasks = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe("*", all.clone()).await;
        bus.subscribe("task", tasks.clone()).await;

        let now = chrono::Utc::now();
        let ev = OutboxEvent::new(LifecycleEventType::TaskCreated, now);
        bus.publish("task.created", &ev).await.unwrap();
        bus.publish("process.instance.start", &ev).await.unwrap();

        assert_eq!(all.0.load(Ordering::SeqCst), 2);
        assert_eq!(tasks.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefix_does_not_match_substrings() {
        assert!(prefix_matches("task", "task.created"));
        assert!(!prefix_matches("task", "taskforce.created"));
        assert!(prefix_matches("*", "anything"));
    }
}
