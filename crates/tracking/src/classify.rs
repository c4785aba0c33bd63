//! Pure decision functions behind the state machine. Kept free of any
//! store/actor dependency so the classification rules can be tested as
//! plain data in, data out.

use model::delay::Classification;
use model::vehicle::{PositionSample, SpatialContext};
use util::geo::haversine_distance;

/// Below this speed a vehicle is considered stationary.
pub const STOPPED_SPEED_THRESHOLD_KMH: f64 = 3.0;

/// A brief stop away from a stop lasting this long or less is GPS noise.
pub const BRIEF_STOP_MAX_SECONDS: i64 = 30;

/// A dwell at a (non-terminal) stop lasting this long or less is ordinary
/// passenger boarding.
pub const NORMAL_DWELL_MAX_SECONDS: i64 = 180;

/// Average speed between two consecutive samples, in km/h. `None` when the
/// elapsed time is zero or negative (an out-of-order or duplicate feed
/// timestamp): speed is undefined here, not zero, and callers must not treat
/// it as a stop observation.
pub fn speed_kmh(prev: &PositionSample, curr: &PositionSample) -> Option<f64> {
    let elapsed_hours = (curr.feed_ts - prev.feed_ts).num_seconds() as f64 / 3600.0;
    if elapsed_hours <= 0.0 {
        return None;
    }
    let distance_km = haversine_distance(prev.lat, prev.lon, curr.lat, curr.lon);
    Some(distance_km / elapsed_hours)
}

pub fn is_stopped(speed_kmh: f64) -> bool {
    speed_kmh < STOPPED_SPEED_THRESHOLD_KMH
}

/// Classifies an ongoing stop of `elapsed_seconds` given its cached spatial
/// context. A terminal stop for the vehicle's own line is always `Ignored`,
/// regardless of how long the vehicle lingers.
pub fn classify(elapsed_seconds: i64, spatial: &SpatialContext) -> Classification {
    if spatial.at_terminal {
        return Classification::Ignored;
    }
    if spatial.at_stop {
        if elapsed_seconds <= NORMAL_DWELL_MAX_SECONDS {
            Classification::NormalDwell
        } else {
            Classification::Blockage
        }
    } else if elapsed_seconds <= BRIEF_STOP_MAX_SECONDS {
        Classification::BriefStop
    } else {
        Classification::Delay
    }
}
