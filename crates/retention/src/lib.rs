//! Cleanup: deletes raw delay events older than the retention window, but
//! only for dates the aggregator has already folded in.

use std::sync::Arc;

use aggregator::AggregateStore;
use chrono::{Duration, NaiveDate, Utc};
use event_store::EventStore;

/// Default retention window in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug)]
pub enum RetentionError {
    Event(event_store::EventStoreError),
    Aggregate(aggregator::AggregateStoreError),
}

impl std::fmt::Display for RetentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionError::Event(why) => write!(f, "retention event-store error: {why}"),
            RetentionError::Aggregate(why) => write!(f, "retention aggregate-store error: {why}"),
        }
    }
}

impl std::error::Error for RetentionError {}

impl From<event_store::EventStoreError> for RetentionError {
    fn from(why: event_store::EventStoreError) -> Self {
        RetentionError::Event(why)
    }
}

impl From<aggregator::AggregateStoreError> for RetentionError {
    fn from(why: aggregator::AggregateStoreError) -> Self {
        RetentionError::Aggregate(why)
    }
}

pub type Result<T> = std::result::Result<T, RetentionError>;

/// What happened, or would happen, to one candidate date.
#[derive(Debug, Clone, PartialEq)]
pub enum DateOutcome {
    /// Events were deleted (or, in dry-run, would be).
    Deleted { date: NaiveDate, events_deleted: u64 },
    /// Skipped because the date has no aggregate yet.
    NotAggregated { date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub outcomes: Vec<DateOutcome>,
}

impl CleanupReport {
    pub fn deleted_event_count(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|outcome| match outcome {
                DateOutcome::Deleted { events_deleted, .. } => *events_deleted,
                DateOutcome::NotAggregated { .. } => 0,
            })
            .sum()
    }

    pub fn skipped_dates(&self) -> Vec<NaiveDate> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                DateOutcome::NotAggregated { date } => Some(*date),
                DateOutcome::Deleted { .. } => None,
            })
            .collect()
    }
}

pub struct Cleaner {
    event_store: Arc<dyn EventStore>,
    aggregate_store: Arc<dyn AggregateStore>,
}

impl Cleaner {
    pub fn new(event_store: Arc<dyn EventStore>, aggregate_store: Arc<dyn AggregateStore>) -> Self {
        Self {
            event_store,
            aggregate_store,
        }
    }

    /// A date is eligible for deletion only once it is aggregated — at
    /// minimum a `DailyLineStat` row for it exists.
    async fn is_aggregated(&self, date: NaiveDate) -> Result<bool> {
        Ok(!self.aggregate_store.daily_lines(date).await?.is_empty())
    }

    /// Runs cleanup for events older than `older_than_days` relative to
    /// `now`. Dry-run by default: pass `execute = true` to actually delete.
    pub async fn run(&self, now: chrono::DateTime<Utc>, older_than_days: i64, execute: bool) -> Result<CleanupReport> {
        let cutoff = (now - Duration::days(older_than_days)).date_naive();
        let candidates = self.event_store.dates_with_events_before(cutoff).await?;

        let mut outcomes = Vec::with_capacity(candidates.len());
        for date in candidates {
            if !self.is_aggregated(date).await? {
                outcomes.push(DateOutcome::NotAggregated { date });
                continue;
            }
            let events_deleted = if execute {
                self.event_store.delete_for_date(date).await?
            } else {
                // Dry-run still reports what *would* be deleted; the count
                // itself has to come from a non-destructive read, so we
                // fall back to the aggregate's own daily total rather than
                // scanning raw rows twice.
                self.aggregate_store
                    .daily_lines(date)
                    .await?
                    .iter()
                    .map(|stat| (stat.delay_count + stat.blockage_count) as u64)
                    .sum()
            };
            outcomes.push(DateOutcome::Deleted { date, events_deleted });
        }

        Ok(CleanupReport {
            dry_run: !execute,
            outcomes,
        })
    }

    /// Unconditionally deletes every date that is aggregated, regardless of
    /// age. Callers are responsible for gating this behind the extra
    /// confirmation a destructive reset like this requires.
    pub async fn reset_all(&self, execute: bool) -> Result<CleanupReport> {
        // far-future cutoff: every aggregated date in the past qualifies.
        let far_future = Utc::now() + Duration::days(365 * 100);
        self.run(far_future, 0, execute).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator::fake::FakeAggregateStore;
    use chrono::TimeZone;
    use event_store::fake::FakeEventStore;
    use model::aggregate::DailyLineStat;
    use model::delay::{NewDelayEvent, PersistedClassification};

    async fn seed_event(store: &FakeEventStore, started_at: chrono::DateTime<Utc>) {
        let id = store
            .create(NewDelayEvent {
                vehicle_id: "V1".to_owned(),
                line: Some("17".to_owned()),
                trip_id: None,
                lat: 52.23,
                lon: 21.01,
                started_at,
                classification: PersistedClassification::Delay,
                at_stop: false,
                near_intersection: false,
            })
            .await
            .unwrap();
        store.resolve(id, started_at + Duration::seconds(40)).await.unwrap();
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let raw_store = FakeEventStore::new();
        let old_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        seed_event(&raw_store, old_date.and_hms_opt(8, 0, 0).unwrap().and_utc()).await;
        let event_store: Arc<dyn EventStore> = Arc::new(raw_store);
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());

        let mut daily = DailyLineStat::empty(old_date, "17".to_owned());
        daily.delay_count = 1;
        aggregate_store.upsert_daily_line(daily).await.unwrap();

        let cleaner = Cleaner::new(event_store.clone(), aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let report = cleaner.run(now, DEFAULT_RETENTION_DAYS, false).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.deleted_event_count(), 1);
        assert_eq!(event_store.scan(old_date.and_hms_opt(0, 0, 0).unwrap().and_utc(), old_date.and_hms_opt(23, 59, 59).unwrap().and_utc()).await.unwrap().len(), 1, "dry-run must not delete");
    }

    #[tokio::test]
    async fn unaggregated_dates_are_reported_and_skipped() {
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());
        let old_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let raw_store = FakeEventStore::new();
        seed_event(&raw_store, old_date.and_hms_opt(8, 0, 0).unwrap().and_utc()).await;
        let event_store: Arc<dyn EventStore> = Arc::new(raw_store);

        let cleaner = Cleaner::new(event_store, aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let report = cleaner.run(now, DEFAULT_RETENTION_DAYS, true).await.unwrap();

        assert_eq!(report.skipped_dates(), vec![old_date]);
        assert_eq!(report.deleted_event_count(), 0);
    }

    #[tokio::test]
    async fn execute_mode_actually_deletes_aggregated_dates() {
        let raw_store = FakeEventStore::new();
        let old_date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        seed_event(&raw_store, old_date.and_hms_opt(8, 0, 0).unwrap().and_utc()).await;
        let event_store: Arc<dyn EventStore> = Arc::new(raw_store);

        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());
        let mut daily = DailyLineStat::empty(old_date, "17".to_owned());
        daily.delay_count = 1;
        aggregate_store.upsert_daily_line(daily).await.unwrap();

        let cleaner = Cleaner::new(event_store.clone(), aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let report = cleaner.run(now, DEFAULT_RETENTION_DAYS, true).await.unwrap();

        assert!(!report.dry_run);
        assert_eq!(report.deleted_event_count(), 1);
        let remaining = event_store
            .scan(
                old_date.and_hms_opt(0, 0, 0).unwrap().and_utc(),
                old_date.and_hms_opt(23, 59, 59).unwrap().and_utc(),
            )
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn recent_dates_within_the_window_are_not_candidates() {
        let raw_store = FakeEventStore::new();
        let recent_date = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        seed_event(&raw_store, recent_date.and_hms_opt(8, 0, 0).unwrap().and_utc()).await;
        let event_store: Arc<dyn EventStore> = Arc::new(raw_store);
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());

        let cleaner = Cleaner::new(event_store, aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let report = cleaner.run(now, DEFAULT_RETENTION_DAYS, true).await.unwrap();

        assert!(report.outcomes.is_empty());
    }
}
