//! The tracker registry: owns the lifecycle of one actor per vehicle, reaps
//! vehicles that stop reporting, and clears out whatever was left open by a
//! previous process run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use actors::actor_ref::ActorRef;
use chrono::{DateTime, Utc};
use event_store::EventStore;
use model::VehicleId;
use reference_store::ReferenceStore;
use tokio::sync::Mutex;

use broker::DelayBroker;

use crate::actor::{Orphaned, PositionUpdate};
use crate::tracker::Tracker;

/// A vehicle not seen in the feed for this long is presumed gone and is
/// reaped.
pub const IDLE_TIMEOUT: StdDuration = StdDuration::from_secs(5 * 60);

struct Entry {
    actor: ActorRef<Tracker>,
    last_seen: DateTime<Utc>,
}

pub struct TrackerRegistry {
    reference_store: Arc<dyn ReferenceStore>,
    event_store: Arc<dyn EventStore>,
    broker: DelayBroker,
    trackers: Mutex<HashMap<VehicleId, Entry>>,
}

impl TrackerRegistry {
    pub fn new(
        reference_store: Arc<dyn ReferenceStore>,
        event_store: Arc<dyn EventStore>,
        broker: DelayBroker,
    ) -> Self {
        Self {
            reference_store,
            event_store,
            broker,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Deletes every unresolved event left over from a previous process run.
    /// Must be called once before the first poll is processed: a
    /// freshly-constructed registry has no in-memory trackers, so any open
    /// event at this point cannot belong to one.
    pub async fn cleanup_orphans_on_startup(&self) -> Result<usize, event_store::EventStoreError> {
        let vehicle_ids = self.event_store.list_unresolved_vehicle_ids().await?;
        for vehicle_id in &vehicle_ids {
            self.event_store
                .delete_orphans_unresolved(vehicle_id)
                .await?;
        }
        Ok(vehicle_ids.len())
    }

    /// Routes a position update to the vehicle's tracker, spawning a new
    /// actor the first time a vehicle is seen.
    pub async fn dispatch(&self, vehicle_id: VehicleId, update: PositionUpdate) {
        let actor = self.get_or_create(vehicle_id).await;
        if let Err(why) = actor.tell(update).await {
            log::error!("failed to dispatch position update: {why:?}");
        }
    }

    async fn get_or_create(&self, vehicle_id: VehicleId) -> ActorRef<Tracker> {
        let mut trackers = self.trackers.lock().await;
        if let Some(entry) = trackers.get_mut(&vehicle_id) {
            entry.last_seen = Utc::now();
            return entry.actor.clone();
        }

        let reference_store = self.reference_store.clone();
        let event_store = self.event_store.clone();
        let broker = self.broker.clone();
        let id_for_factory = vehicle_id.clone();

        let actor = actors::run(move || {
            Tracker::new(
                id_for_factory.clone(),
                reference_store.clone(),
                event_store.clone(),
                broker.clone(),
            )
        });

        trackers.insert(
            vehicle_id,
            Entry {
                actor: actor.clone(),
                last_seen: Utc::now(),
            },
        );
        actor
    }

    /// Drops and orphans every tracker not seen within `IDLE_TIMEOUT`.
    /// Intended to be called periodically by the poller alongside each poll
    /// cycle.
    pub async fn reap_idle(&self) {
        let now = Utc::now();
        let mut trackers = self.trackers.lock().await;
        let idle: Vec<VehicleId> = trackers
            .iter()
            .filter(|(_, entry)| {
                now.signed_duration_since(entry.last_seen)
                    .to_std()
                    .map(|elapsed| elapsed >= IDLE_TIMEOUT)
                    .unwrap_or(false)
            })
            .map(|(vehicle_id, _)| vehicle_id.clone())
            .collect();

        for vehicle_id in idle {
            if let Some(entry) = trackers.remove(&vehicle_id) {
                if let Err(why) = entry.actor.tell(Orphaned).await {
                    log::error!("failed to deliver orphan cleanup to {vehicle_id}: {why:?}");
                }
            }
        }
    }

    pub async fn active_vehicle_count(&self) -> usize {
        self.trackers.lock().await.len()
    }
}
