use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use coedit_protocol::{Notification, NotifyEvent};

const CHANNEL_CAPACITY: usize = 64;

/// Topic-based change notification fan-out, one broadcast channel per
/// entity kind.
///
/// Delivery is best-effort: no acknowledgement, no retry, no replay. A
/// publish with no live subscribers is dropped silently, and a subscriber
/// that lags past the channel capacity misses events and must reconcile by
/// rebuilding from the store. Publish order is preserved per topic for
/// each subscriber.
pub struct ChangeBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Notification>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register for all future publishes on `topic`, creating the channel
    /// on demand. The subscription ends when the receiver is dropped.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Notification> {
        if let Some(tx) = self.channels.read().await.get(topic) {
            return tx.subscribe();
        }
        self.channels
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire-and-forget publish. Never fails the caller: the triggering
    /// mutation has already committed, so delivery problems are logged and
    /// swallowed. Callers must only publish after the mutation is visible
    /// to readers.
    pub async fn publish(&self, topic: &str, event: NotifyEvent) {
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(topic) else {
            debug!(topic = %topic, "notification dropped: topic has never been subscribed");
            return;
        };
        let notification = Notification {
            topic: topic.to_string(),
            event,
        };
        if tx.send(notification).is_err() {
            debug!(topic = %topic, "notification dropped: no live subscribers");
        }
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_protocol::topic_for;

    #[tokio::test]
    async fn subscribe_publish_receive() {
        let bus = ChangeBus::new();
        let topic = topic_for("card");
        let mut rx = bus.subscribe(&topic).await;

        bus.publish(&topic, NotifyEvent::StateChanged { row_id: None })
            .await;

        let n = rx.recv().await.expect("recv");
        assert_eq!(n.topic, topic);
        assert_eq!(n.event, NotifyEvent::StateChanged { row_id: None });
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = ChangeBus::new();
        bus.publish(&topic_for("card"), NotifyEvent::StateChanged { row_id: None })
            .await;
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let bus = ChangeBus::new();
        let topic = topic_for("card");
        let mut rx = bus.subscribe(&topic).await;

        for i in 0..5 {
            bus.publish(
                &topic,
                NotifyEvent::ItemCreated {
                    row_id: i.to_string(),
                },
            )
            .await;
        }

        for i in 0..5 {
            match rx.recv().await.expect("recv").event {
                NotifyEvent::ItemCreated { row_id } => assert_eq!(row_id, i.to_string()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = ChangeBus::new();
        let mut cards = bus.subscribe(&topic_for("card")).await;
        let mut meals = bus.subscribe(&topic_for("meal")).await;

        bus.publish(
            &topic_for("meal"),
            NotifyEvent::ItemDeleted {
                row_id: "9".to_string(),
            },
        )
        .await;

        assert!(matches!(
            meals.recv().await.expect("recv").event,
            NotifyEvent::ItemDeleted { .. }
        ));
        assert!(cards.try_recv().is_err());
    }
}
