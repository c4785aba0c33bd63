//! The vehicle tracker state machine: one instance per vehicle, folding
//! each incoming position sample into `Unknown` / `Moving` / `Stopped` and
//! coupling persist-worthy stops to the event store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use model::delay::{DelayEvent, DelayEventRecord, NewDelayEvent};
use model::vehicle::{PositionSample, SpatialContext, VehicleState};
use model::VehicleId;
use util::id::Id;

use broker::{DelayBroker, DelayTopicEvent};
use event_store::EventStore;
use reference_store::ReferenceStore;

use crate::classify::{classify, is_stopped, speed_kmh};

#[derive(Debug)]
pub enum TrackingError {
    Reference(reference_store::ReferenceError),
    Event(event_store::EventStoreError),
}

impl std::fmt::Display for TrackingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingError::Reference(why) => write!(f, "{why}"),
            TrackingError::Event(why) => write!(f, "{why}"),
        }
    }
}

impl std::error::Error for TrackingError {}

impl From<reference_store::ReferenceError> for TrackingError {
    fn from(why: reference_store::ReferenceError) -> Self {
        TrackingError::Reference(why)
    }
}

impl From<event_store::EventStoreError> for TrackingError {
    fn from(why: event_store::EventStoreError) -> Self {
        TrackingError::Event(why)
    }
}

/// In-memory working state for one vehicle. Deliberately holds no store
/// handle: a `Tracker` owns this and the stores both.
#[derive(Debug, Clone, Default)]
struct Working {
    state: VehicleState,
    last_position: Option<PositionSample>,
    /// Set when a stop begins; per the adopted design note, this is also the
    /// value persisted as `DelayEvent::started_at`.
    stopped_since: Option<DateTime<Utc>>,
    spatial_context: Option<SpatialContext>,
    open_event: Option<Id<DelayEvent>>,
    line: Option<String>,
    trip_id: Option<String>,
}

/// Owns one vehicle's classification state plus the stores/broker needed to
/// escalate a stop into a persisted event and publish it.
pub struct Tracker {
    vehicle_id: VehicleId,
    reference_store: Arc<dyn ReferenceStore>,
    event_store: Arc<dyn EventStore>,
    broker: DelayBroker,
    working: Working,
}

impl Tracker {
    pub fn new(
        vehicle_id: VehicleId,
        reference_store: Arc<dyn ReferenceStore>,
        event_store: Arc<dyn EventStore>,
        broker: DelayBroker,
    ) -> Self {
        Self {
            vehicle_id,
            reference_store,
            event_store,
            broker,
            working: Working::default(),
        }
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn state(&self) -> VehicleState {
        self.working.state
    }

    /// Folds one new position sample into the state machine.
    pub async fn on_position(
        &mut self,
        sample: PositionSample,
        line: Option<String>,
        trip_id: Option<String>,
    ) -> Result<(), TrackingError> {
        self.working.line = line;
        self.working.trip_id = trip_id;

        let prev = match self.working.last_position.replace(sample) {
            Some(prev) => prev,
            None => {
                // First sample ever seen for this vehicle: nothing to derive
                // a speed from yet.
                self.working.state = VehicleState::Unknown;
                return Ok(());
            }
        };

        let speed = match speed_kmh(&prev, &sample) {
            Some(speed) => speed,
            None => {
                // Out-of-order or duplicate feed timestamp: speed is
                // undefined, not zero. Leave any open stop untouched and
                // wait for the next sample rather than guessing.
                self.working.state = VehicleState::Unknown;
                return Ok(());
            }
        };
        let stopped_now = is_stopped(speed);

        match (self.working.state, stopped_now) {
            (VehicleState::Stopped, true) => self.continue_stop(sample).await,
            (_, true) => {
                // Moving/Unknown -> Stopped: the vehicle has been stationary
                // since `prev`, not `sample`.
                self.working.state = VehicleState::Stopped;
                self.working.stopped_since = Some(prev.feed_ts);
                self.working.spatial_context = None;
                self.working.open_event = None;
                self.continue_stop(sample).await
            }
            (VehicleState::Stopped, false) => self.end_stop(prev.feed_ts).await,
            (_, false) => {
                self.working.state = VehicleState::Moving;
                Ok(())
            }
        }
    }

    /// Called when a vehicle drops out of the feed for the idle timeout: any
    /// open event is force-resolved at the moment of reaping rather than
    /// left open forever, since there is no grace period to merge it with a
    /// future reappearance.
    pub async fn on_orphaned(&mut self) -> Result<(), TrackingError> {
        if self.working.open_event.is_some() {
            self.end_stop(Utc::now()).await?;
        }
        Ok(())
    }

    async fn continue_stop(&mut self, sample: PositionSample) -> Result<(), TrackingError> {
        let stopped_since = self
            .working
            .stopped_since
            .expect("stopped_since set on transition into Stopped");

        let spatial = match self.working.spatial_context {
            Some(spatial) => spatial,
            None => match self.compute_spatial_context(sample).await {
                Ok(spatial) => {
                    self.working.spatial_context = Some(spatial);
                    spatial
                }
                Err(why) => {
                    // Boolean lookups surface errors; skip classification
                    // this cycle and retry on the next one.
                    log::warn!(
                        "vehicle {}: reference lookup failed, skipping cycle: {why}",
                        self.vehicle_id
                    );
                    return Ok(());
                }
            },
        };

        let elapsed_seconds = (sample.feed_ts - stopped_since).num_seconds();
        let classification = classify(elapsed_seconds, &spatial);

        if classification.is_persist_worthy() && self.working.open_event.is_none() {
            let persisted = classification
                .to_persisted()
                .expect("is_persist_worthy implies to_persisted is Some");
            let new_event = NewDelayEvent {
                vehicle_id: self.vehicle_id.clone(),
                line: self.working.line.clone(),
                trip_id: self.working.trip_id.clone(),
                lat: sample.lat,
                lon: sample.lon,
                started_at: stopped_since,
                classification: persisted,
                at_stop: spatial.at_stop,
                near_intersection: spatial.near_intersection,
            };
            let id = self.event_store.create(new_event.clone()).await?;
            self.working.open_event = Some(id);

            self.broker.publish(DelayTopicEvent::Started(DelayEventRecord {
                id,
                event: DelayEvent {
                    vehicle_id: new_event.vehicle_id,
                    line: new_event.line,
                    trip_id: new_event.trip_id,
                    lat: new_event.lat,
                    lon: new_event.lon,
                    started_at: new_event.started_at,
                    resolved_at: None,
                    duration_seconds: None,
                    classification: persisted,
                    at_stop: new_event.at_stop,
                    near_intersection: new_event.near_intersection,
                    multi_cycle: false,
                },
            }));
        }

        Ok(())
    }

    async fn end_stop(&mut self, resolved_at: DateTime<Utc>) -> Result<(), TrackingError> {
        if let Some(id) = self.working.open_event.take() {
            let resolved = self.event_store.resolve(id, resolved_at).await?;
            self.broker.publish(DelayTopicEvent::Resolved(DelayEventRecord {
                id,
                event: resolved,
            }));
        }

        self.working.state = VehicleState::Moving;
        self.working.stopped_since = None;
        self.working.spatial_context = None;
        Ok(())
    }

    async fn compute_spatial_context(
        &self,
        sample: PositionSample,
    ) -> Result<SpatialContext, reference_store::ReferenceError> {
        let at_stop = self
            .reference_store
            .near_stop(sample.lat, sample.lon)
            .await?;
        let near_intersection = self
            .reference_store
            .near_intersection(sample.lat, sample.lon)
            .await?;
        let at_terminal = self
            .reference_store
            .line_has_terminal_at(self.working.line.as_deref(), sample.lat, sample.lon)
            .await?;
        Ok(SpatialContext {
            at_stop,
            near_intersection,
            at_terminal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use event_store::fake::FakeEventStore;
    use reference_store::fake::FakeReferenceStore;

    fn position(lat: f64, lon: f64, offset_secs: i64) -> PositionSample {
        let base = Utc.with_ymd_and_hms(2025, 1, 7, 14, 0, 0).unwrap();
        let ts = base + Duration::seconds(offset_secs);
        PositionSample {
            lat,
            lon,
            feed_ts: ts,
            received_at: ts,
        }
    }

    fn build_tracker() -> (
        Tracker,
        Arc<FakeReferenceStore>,
        Arc<FakeEventStore>,
        DelayBroker,
    ) {
        let reference_store = Arc::new(FakeReferenceStore::new());
        let event_store = Arc::new(FakeEventStore::new());
        let broker = DelayBroker::new(16);
        let tracker = Tracker::new(
            "V1".to_owned(),
            reference_store.clone(),
            event_store.clone(),
            broker.clone(),
        );
        (tracker, reference_store, event_store, broker)
    }

    /// Corresponds to scenario S1: a tram idles away from any stop for more
    /// than 30s and a `Delay` is created, then resolved on movement.
    #[tokio::test]
    async fn prolonged_stop_away_from_a_stop_becomes_a_delay() {
        let (mut tracker, _refs, events, _broker) = build_tracker();

        tracker
            .on_position(position(52.20, 21.05, 0), Some("17".to_owned()), None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 10), Some("17".to_owned()), None)
            .await
            .unwrap();
        assert_eq!(tracker.state(), VehicleState::Stopped);

        tracker
            .on_position(position(52.20, 21.05, 45), Some("17".to_owned()), None)
            .await
            .unwrap();

        let stored = events.all().await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].resolved_at.is_none());

        // Vehicle starts moving again, far enough to exceed the speed
        // threshold in the elapsed time.
        tracker
            .on_position(position(52.30, 21.20, 60), Some("17".to_owned()), None)
            .await
            .unwrap();

        let stored = events.all().await;
        assert!(stored[0].resolved_at.is_some());
        assert_eq!(tracker.state(), VehicleState::Moving);
    }

    #[tokio::test]
    async fn brief_stop_never_persists_an_event() {
        let (mut tracker, _refs, events, _broker) = build_tracker();

        tracker
            .on_position(position(52.20, 21.05, 0), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 10), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 20), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.30, 21.20, 30), None, None)
            .await
            .unwrap();

        assert!(events.all().await.is_empty());
    }

    #[tokio::test]
    async fn stop_at_a_terminal_is_always_ignored() {
        let (mut tracker, refs, events, _broker) = build_tracker();
        refs.add_stop(model::reference::Stop {
            id: "T1".to_owned(),
            name: "Terminal".to_owned(),
            point: model::reference::Point { lat: 52.20, lon: 21.05 },
            is_terminal: true,
        })
        .await;
        refs.add_terminal(model::reference::LineTerminal {
            line: "17".to_owned(),
            stop_id: "T1".to_owned(),
        })
        .await;

        tracker
            .on_position(position(52.20, 21.05, 0), Some("17".to_owned()), None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 10), Some("17".to_owned()), None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 10_000), Some("17".to_owned()), None)
            .await
            .unwrap();

        assert!(events.all().await.is_empty());
    }

    #[tokio::test]
    async fn orphaning_a_vehicle_force_resolves_its_open_event() {
        let (mut tracker, _refs, events, _broker) = build_tracker();

        tracker
            .on_position(position(52.20, 21.05, 0), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 10), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 45), None, None)
            .await
            .unwrap();
        let stored = events.all().await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].resolved_at.is_none());

        tracker.on_orphaned().await.unwrap();
        let stored = events.all().await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].resolved_at.is_some());
    }

    #[tokio::test]
    async fn an_out_of_order_sample_leaves_the_open_stop_untouched() {
        let (mut tracker, _refs, events, _broker) = build_tracker();

        tracker
            .on_position(position(52.20, 21.05, 0), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 10), None, None)
            .await
            .unwrap();
        tracker
            .on_position(position(52.20, 21.05, 45), None, None)
            .await
            .unwrap();
        assert_eq!(events.all().await.len(), 1);

        // A duplicate/out-of-order feed timestamp for the same instant.
        tracker
            .on_position(position(52.20, 21.05, 45), None, None)
            .await
            .unwrap();
        assert_eq!(tracker.state(), VehicleState::Unknown);
        let stored = events.all().await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].resolved_at.is_none());
    }
}
