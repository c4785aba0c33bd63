//! Wires `Tracker` into the generic actor runtime: one actor per vehicle,
//! supervised so a panic in one vehicle's handler never takes down
//! another's.

use std::any::Any;

use actors::actor::{Actor, SupervisionStrategy};
use actors::handler::{Handler, Message};
use async_trait::async_trait;
use model::vehicle::PositionSample;

use crate::tracker::Tracker;

#[derive(Clone)]
pub struct PositionUpdate {
    pub sample: PositionSample,
    pub line: Option<String>,
    pub trip_id: Option<String>,
}

impl Message for PositionUpdate {
    type Response = ();
}

#[derive(Clone)]
pub struct Orphaned;

impl Message for Orphaned {
    type Response = ();
}

impl Actor for Tracker {
    /// A panic loses nothing worth restarting for: the in-memory stop timer
    /// (`stopped_since`) is the only state that can't be recomputed, and a
    /// fresh actor would start back at `Unknown`, silently resetting any
    /// in-progress delay. Resuming keeps the timer intact and drops only the
    /// one position sample that triggered the panic.
    fn on_fail(&mut self, error: Box<dyn Any + Send>) -> SupervisionStrategy {
        log::error!("tracker for {} panicked: {:?}", self.vehicle_id(), error);
        SupervisionStrategy::Resume
    }
}

#[async_trait]
impl Handler<PositionUpdate> for Tracker {
    async fn handle(&mut self, message: PositionUpdate) -> () {
        if let Err(why) = self
            .on_position(message.sample, message.line, message.trip_id)
            .await
        {
            log::error!("tracker for {} failed to process position: {why}", self.vehicle_id());
        }
    }
}

#[async_trait]
impl Handler<Orphaned> for Tracker {
    async fn handle(&mut self, _message: Orphaned) -> () {
        if let Err(why) = self.on_orphaned().await {
            log::error!("tracker for {} failed to clean up orphan: {why}", self.vehicle_id());
        }
    }
}
