use pik_contracts::EventRecord;
use tokio::sync::broadcast;

/// In-process fan-out for committed ledger events. Publishing never blocks:
/// the channel is bounded and a subscriber that falls behind drops its oldest
/// pending events instead of stalling the publisher or its peers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: EventRecord) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(event_id: &str) -> EventRecord {
        EventRecord {
            event_id: event_id.to_string(),
            root_id: "root".to_string(),
            event_type: "progression.session_completed".to_string(),
            source_id: None,
            payload: serde_json::json!({}),
            changes: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event_exactly_once() {
        let bus = EventBus::new(16);
        let mut receivers = (0..5).map(|_| bus.subscribe()).collect::<Vec<_>>();
        assert_eq!(bus.subscriber_count(), 5);

        bus.publish(event("e1"));
        bus.publish(event("e2"));

        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap().event_id, "e1");
            assert_eq!(rx.recv().await.unwrap().event_id, "e2");
            assert!(rx.try_recv().is_err(), "no duplicate delivery");
        }
    }

    #[tokio::test]
    async fn dropping_a_receiver_unsubscribes_it() {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        let mut other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event("e1"));
        assert_eq!(other.recv().await.unwrap().event_id, "e1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(event("e1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_stale_events_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(&format!("e{i}")));
        }

        // The first receive reports the lag; later events are still delivered.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 1),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().event_id, "e3");
        assert_eq!(rx.recv().await.unwrap().event_id, "e4");
    }
}
