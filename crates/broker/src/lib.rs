//! The event broker: a single `"delays"` topic vehicle trackers publish to
//! and the query router (or any other observer) subscribes to. Delivery is
//! at-most-once and non-blocking: a slow or absent subscriber never backs up
//! a tracker.

use model::delay::DelayEventRecord;
use tokio::sync::broadcast;

pub const TOPIC: &str = "delays";

#[derive(Debug, Clone)]
pub enum DelayTopicEvent {
    Started(DelayEventRecord),
    Resolved(DelayEventRecord),
}

/// Cloning gives every subscriber its own independent lagging cursor.
#[derive(Clone)]
pub struct DelayBroker {
    sender: broadcast::Sender<DelayTopicEvent>,
}

impl DelayBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Drops the event instead of blocking if there are no subscribers or a
    /// subscriber's buffer is full — publishing must never stall a tracker.
    pub fn publish(&self, event: DelayTopicEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("published to {TOPIC} with no active subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DelayTopicEvent> {
        self.sender.subscribe()
    }
}

impl Default for DelayBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::delay::{DelayEvent, PersistedClassification};
    use util::id::Id;

    fn sample_record() -> DelayEventRecord {
        DelayEventRecord {
            id: Id::new(1),
            event: DelayEvent {
                vehicle_id: "V1".to_owned(),
                line: Some("17".to_owned()),
                trip_id: None,
                lat: 52.23,
                lon: 21.01,
                started_at: Utc::now(),
                resolved_at: None,
                duration_seconds: None,
                classification: PersistedClassification::Delay,
                at_stop: false,
                near_intersection: false,
                multi_cycle: false,
            },
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broker = DelayBroker::new(16);
        let mut rx = broker.subscribe();
        broker.publish(DelayTopicEvent::Started(sample_record()));

        match rx.recv().await.unwrap() {
            DelayTopicEvent::Started(record) => assert_eq!(record.event.vehicle_id, "V1"),
            _ => panic!("expected Started"),
        }
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_does_not_panic() {
        let broker = DelayBroker::new(16);
        broker.publish(DelayTopicEvent::Started(sample_record()));
    }
}
