use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use util::id::{HasId, Id};

use crate::vehicle::VehicleId;

/// Full classification space the tracker reasons about. Only `Delay` and
/// `Blockage` are ever persisted; `Ignored`, `NormalDwell` and `BriefStop`
/// are internal labels that never leave the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Stopped at a terminal stop for the vehicle's own line: normal layover.
    Ignored,
    /// Stopped at a (non-terminal) stop for <= 180s: ordinary passenger dwell.
    NormalDwell,
    /// Stopped away from a stop for <= 30s: GPS noise / traffic light twitch.
    BriefStop,
    /// Stopped away from a stop for > 30s.
    Delay,
    /// Stopped at a (non-terminal) stop for > 180s.
    Blockage,
}

impl Classification {
    /// Only `Delay` and `Blockage` ever get written to the event store.
    pub fn is_persist_worthy(&self) -> bool {
        matches!(self, Classification::Delay | Classification::Blockage)
    }

    pub fn to_persisted(self) -> Option<PersistedClassification> {
        match self {
            Classification::Delay => Some(PersistedClassification::Delay),
            Classification::Blockage => Some(PersistedClassification::Blockage),
            _ => None,
        }
    }
}

/// The classification values that may actually appear on a stored
/// `DelayEvent` (`classification ∈ {delay, blockage}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedClassification {
    Delay,
    Blockage,
}

impl PersistedClassification {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            PersistedClassification::Delay => "delay",
            PersistedClassification::Blockage => "blockage",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "delay" => Some(Self::Delay),
            "blockage" => Some(Self::Blockage),
            _ => None,
        }
    }
}

/// A persisted delay event. `id` is assigned on create by the event store;
/// everything else mirrors the tracker's view of the immobility that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayEvent {
    pub vehicle_id: VehicleId,
    pub line: Option<String>,
    pub trip_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub classification: PersistedClassification,
    pub at_stop: bool,
    pub near_intersection: bool,
    pub multi_cycle: bool,
}

impl HasId for DelayEvent {
    type IdType = i64;
}

/// Everything needed to create a new delay event. `id`, `resolved_at`,
/// `duration_seconds` and `multi_cycle` are not yet known.
#[derive(Debug, Clone)]
pub struct NewDelayEvent {
    pub vehicle_id: VehicleId,
    pub line: Option<String>,
    pub trip_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub started_at: DateTime<Utc>,
    pub classification: PersistedClassification,
    pub at_stop: bool,
    pub near_intersection: bool,
}

/// A stored event together with the id the store assigned it, passed around
/// the broker and the query router once an event leaves the tracker.
#[derive(Debug, Clone)]
pub struct DelayEventRecord {
    pub id: Id<DelayEvent>,
    pub event: DelayEvent,
}

/// The signal-cycle length: a delay that outlasts this while near an
/// intersection is evidence of a priority-system failure.
pub const SIGNAL_CYCLE_SECONDS: i64 = 120;

/// Computes whether a resolved event qualifies as `multi_cycle`:
/// `duration_seconds > 120 ∧ near_intersection`, snapshotted at resolve
/// time and never recomputed from location afterwards.
pub fn is_multi_cycle(duration_seconds: i64, near_intersection: bool) -> bool {
    duration_seconds > SIGNAL_CYCLE_SECONDS && near_intersection
}
