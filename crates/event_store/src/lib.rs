//! The delay-event store: durable storage for delay/blockage events as the
//! tracker's state machine creates, escalates and resolves them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::delay::{DelayEvent, NewDelayEvent};
use util::id::Id;

pub mod fake;
pub mod postgres;

#[derive(Debug)]
pub enum EventStoreError {
    Backend(Box<dyn std::error::Error + Send + Sync>),
    NotFound,
}

impl std::fmt::Display for EventStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStoreError::Backend(why) => write!(f, "event store error: {why}"),
            EventStoreError::NotFound => write!(f, "delay event not found"),
        }
    }
}

impl std::error::Error for EventStoreError {}

pub type Result<T> = std::result::Result<T, EventStoreError>;

/// Durable storage for `DelayEvent`s. A tracker holds at most one unresolved
/// event per vehicle at a time; the store itself does not enforce that — it
/// is an invariant of the tracker's state machine, not of the persistence
/// layer.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts an open (unresolved) event and returns its assigned id.
    async fn create(&self, event: NewDelayEvent) -> Result<Id<DelayEvent>>;

    async fn get(&self, id: Id<DelayEvent>) -> Result<DelayEvent>;

    /// Closes an open event: sets `resolved_at`, `duration_seconds` and
    /// `multi_cycle`. Idempotent on an already-resolved event is a backend
    /// error, not a silent no-op — the tracker never resolves the same id
    /// twice by construction.
    async fn resolve(&self, id: Id<DelayEvent>, resolved_at: DateTime<Utc>) -> Result<DelayEvent>;

    /// The open event for a vehicle, if any (used on actor restart to
    /// recover in-flight state).
    async fn find_unresolved_by_vehicle(&self, vehicle_id: &str) -> Result<Option<DelayEvent>>;

    /// Deletes (not resolves) every unresolved event belonging to a vehicle,
    /// used only at process startup to clear whatever was left open by a
    /// previous run. A vehicle idling out of the live feed is handled
    /// separately, by force-resolving its open event rather than deleting
    /// it.
    async fn delete_orphans_unresolved(&self, vehicle_id: &str) -> Result<u64>;

    /// Every vehicle with an unresolved event, used once at process startup:
    /// trackers hold no persisted state of their own, so any event still
    /// open when the process starts belongs to a tracker that no longer
    /// exists in memory and is itself an orphan.
    async fn list_unresolved_vehicle_ids(&self) -> Result<Vec<String>>;

    /// All resolved, persist-worthy events whose `started_at` falls in
    /// `[from, to)`, used by the hourly aggregator and the query router's
    /// raw tail.
    async fn scan(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DelayEvent>>;

    /// Deletes every event whose `started_at` falls on `date`, used by
    /// cleanup once that date is confirmed aggregated. Returns the number
    /// of rows removed.
    async fn delete_for_date(&self, date: chrono::NaiveDate) -> Result<u64>;

    /// Distinct dates with at least one stored event older than `cutoff`,
    /// used by cleanup to enumerate deletion candidates.
    async fn dates_with_events_before(&self, cutoff: chrono::NaiveDate) -> Result<Vec<chrono::NaiveDate>>;
}
