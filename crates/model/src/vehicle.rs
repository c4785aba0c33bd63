use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a single physical transit vehicle, e.g. `"V/17/5"` (line 17,
/// brigade 5).
pub type VehicleId = String;

/// A single reported position of a vehicle, as handed to the tracker by the
/// poller after the GTFS-Realtime feed has already been decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub lat: f64,
    pub lon: f64,
    /// Timestamp carried in the feed itself.
    pub feed_ts: DateTime<Utc>,
    /// Wall-clock time the poller received this sample.
    pub received_at: DateTime<Utc>,
}

/// The tracker's belief about whether a vehicle is moving, stationary, or
/// not yet classifiable (e.g. only one sample seen so far).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VehicleState {
    #[default]
    Unknown,
    Moving,
    Stopped,
}

/// Cached result of the three spatial lookups performed once per stopped
/// episode. Cleared whenever the vehicle moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpatialContext {
    pub at_stop: bool,
    pub near_intersection: bool,
    pub at_terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spatial_context_default_is_all_false() {
        let ctx = SpatialContext::default();
        assert!(!ctx.at_stop && !ctx.near_intersection && !ctx.at_terminal);
    }
}
