//! The hourly aggregator: folds each closed hour's resolved delay events
//! into the hourly/daily/pattern roll-ups the query router reads from.

use async_trait::async_trait;
use chrono::NaiveDate;
use model::aggregate::{DailyIntersectionStat, DailyLineStat, HourlyIntersectionStat, HourlyPatternRow, LocationBucket};

pub mod compute;
pub mod fake;
pub mod postgres;
pub mod schedule;

pub use schedule::Aggregator;

#[derive(Debug)]
pub enum AggregateStoreError {
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for AggregateStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateStoreError::Backend(why) => write!(f, "aggregate store error: {why}"),
        }
    }
}

impl std::error::Error for AggregateStoreError {}

pub type Result<T> = std::result::Result<T, AggregateStoreError>;

/// Persistence for the roll-ups the aggregator produces and the query
/// router reads. Every upsert is a full replace keyed by its natural key,
/// so re-aggregating an hour is always safe.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn upsert_hourly_intersection(&self, stat: HourlyIntersectionStat) -> Result<()>;

    /// Every hourly row stored so far for `(date, bucket)`, used to
    /// recompute the daily total from scratch rather than accumulate onto a
    /// value that might already include a previous run of the same hour.
    async fn hourly_intersections(
        &self,
        date: NaiveDate,
        bucket: LocationBucket,
    ) -> Result<Vec<HourlyIntersectionStat>>;

    async fn upsert_daily_intersection(&self, stat: DailyIntersectionStat) -> Result<()>;

    /// Every daily intersection row stored for `date`, used by the query
    /// router to build hot spots without knowing buckets in advance.
    async fn daily_intersections(&self, date: NaiveDate) -> Result<Vec<DailyIntersectionStat>>;

    async fn daily_line(&self, date: NaiveDate, line: &str) -> Result<Option<DailyLineStat>>;

    /// Every daily line row stored for `date`, used by the query router's
    /// impacted-lines figure.
    async fn daily_lines(&self, date: NaiveDate) -> Result<Vec<DailyLineStat>>;

    async fn upsert_daily_line(&self, stat: DailyLineStat) -> Result<()>;

    /// The full all-time pattern table, served directly to the heatmap
    /// query with no merge.
    async fn hourly_pattern(&self) -> Result<Vec<HourlyPatternRow>>;

    /// Adds to the all-time 168-row pattern table. Only ever called once per
    /// closed hour (guarded by `is_hour_aggregated`), so the addition itself
    /// does not need to be idempotent.
    async fn accumulate_hourly_pattern(&self, rows: Vec<HourlyPatternRow>) -> Result<()>;

    async fn mark_hour_aggregated(&self, date: NaiveDate, hour: u32) -> Result<()>;

    async fn is_hour_aggregated(&self, date: NaiveDate, hour: u32) -> Result<bool>;

    /// The most recent `(date, hour)` marked aggregated, used to resume
    /// catch-up after a restart.
    async fn last_aggregated_hour(&self) -> Result<Option<(NaiveDate, u32)>>;
}
