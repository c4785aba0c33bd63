//! The query router: serves every dashboard-visible figure as an
//! aggregate-store result merged with the raw tail since the last
//! aggregation boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use aggregator::compute::tail_boundary;
use aggregator::AggregateStore;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use event_store::EventStore;
use model::aggregate::{HourBreakdown, HourlyPatternRow, LocationBucket};
use model::delay::{DelayEvent, PersistedClassification};

#[derive(Debug)]
pub enum QueryError {
    Event(event_store::EventStoreError),
    Aggregate(aggregator::AggregateStoreError),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Event(why) => write!(f, "query router event-store error: {why}"),
            QueryError::Aggregate(why) => write!(f, "query router aggregate-store error: {why}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<event_store::EventStoreError> for QueryError {
    fn from(why: event_store::EventStoreError) -> Self {
        QueryError::Event(why)
    }
}

impl From<aggregator::AggregateStoreError> for QueryError {
    fn from(why: aggregator::AggregateStoreError) -> Self {
        QueryError::Aggregate(why)
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq)]
pub struct HotSpot {
    pub bucket: LocationBucket,
    pub delay_count: i64,
    pub multi_cycle_count: i64,
    pub total_seconds: i64,
    pub cost_pln: f64,
    pub lines: BTreeSet<String>,
    pub nearest_stop_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImpactedLine {
    pub line: String,
    pub delay_count: i64,
    pub blockage_count: i64,
    pub total_seconds: i64,
    pub average_seconds: f64,
    pub intersection_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub total_delay_count: i64,
    pub total_blockage_count: i64,
    pub total_seconds: i64,
    pub total_cost_pln: f64,
    pub lines_affected: usize,
}

/// Merges the aggregate store's view of `date` with the still-unaggregated
/// raw tail. Every method takes `now` explicitly rather than reading the
/// wall clock, since the tail boundary is a function of it.
pub struct QueryRouter {
    event_store: Arc<dyn EventStore>,
    aggregate_store: Arc<dyn AggregateStore>,
}

impl QueryRouter {
    pub fn new(event_store: Arc<dyn EventStore>, aggregate_store: Arc<dyn AggregateStore>) -> Self {
        Self {
            event_store,
            aggregate_store,
        }
    }

    async fn raw_tail(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Vec<DelayEvent>> {
        let boundary = tail_boundary(now);
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time")
            .and_utc();
        let day_end = day_start + chrono::Duration::days(1);
        let from = boundary.max(day_start);
        if from >= day_end.min(now) {
            return Ok(Vec::new());
        }
        Ok(self.event_store.scan(from, day_end.min(now)).await?)
    }

    /// Hot spots for `date`: the day's intersection aggregates, with the
    /// still-unaggregated raw tail folded in bucket-by-bucket.
    pub async fn hot_spots(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Vec<HotSpot>> {
        let daily = self.aggregate_store.daily_intersections(date).await?;
        let mut by_bucket: BTreeMap<LocationBucket, HotSpot> = daily
            .into_iter()
            .map(|stat| {
                (
                    stat.bucket,
                    HotSpot {
                        bucket: stat.bucket,
                        delay_count: stat.delay_count,
                        multi_cycle_count: stat.multi_cycle_count,
                        total_seconds: stat.total_seconds,
                        cost_pln: stat.cost_pln,
                        lines: stat.lines,
                        nearest_stop_name: stat.nearest_stop_name,
                    },
                )
            })
            .collect();

        for event in self.raw_tail(date, now).await? {
            if !event.near_intersection {
                continue;
            }
            let bucket = LocationBucket::new(event.lat, event.lon);
            let entry = by_bucket.entry(bucket).or_insert_with(|| HotSpot {
                bucket,
                delay_count: 0,
                multi_cycle_count: 0,
                total_seconds: 0,
                cost_pln: 0.0,
                lines: BTreeSet::new(),
                nearest_stop_name: None,
            });
            entry.delay_count += 1;
            if event.multi_cycle {
                entry.multi_cycle_count += 1;
            }
            entry.total_seconds += event.duration_seconds.unwrap_or(0);
            if let Some(line) = event.line {
                entry.lines.insert(line);
            }
        }

        Ok(by_bucket.into_values().collect())
    }

    /// Impacted lines for `date`: the day's per-line aggregates with the raw
    /// tail's counts added in and the average recomputed.
    pub async fn impacted_lines(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Vec<ImpactedLine>> {
        let daily = self.aggregate_store.daily_lines(date).await?;
        let mut by_line: BTreeMap<String, ImpactedLine> = daily
            .into_iter()
            .map(|stat| {
                (
                    stat.line.clone(),
                    ImpactedLine {
                        line: stat.line,
                        delay_count: stat.delay_count,
                        blockage_count: stat.blockage_count,
                        total_seconds: stat.total_seconds,
                        average_seconds: 0.0,
                        intersection_count: stat.intersection_count,
                    },
                )
            })
            .collect();

        for event in self.raw_tail(date, now).await? {
            let Some(line) = event.line.clone() else { continue };
            let entry = by_line.entry(line.clone()).or_insert_with(|| ImpactedLine {
                line,
                delay_count: 0,
                blockage_count: 0,
                total_seconds: 0,
                average_seconds: 0.0,
                intersection_count: 0,
            });
            match event.classification {
                PersistedClassification::Delay => entry.delay_count += 1,
                PersistedClassification::Blockage => entry.blockage_count += 1,
            }
            entry.total_seconds += event.duration_seconds.unwrap_or(0);
            if event.near_intersection {
                entry.intersection_count += 1;
            }
        }

        for line in by_line.values_mut() {
            let occurrences = line.delay_count + line.blockage_count;
            line.average_seconds = if occurrences > 0 {
                line.total_seconds as f64 / occurrences as f64
            } else {
                0.0
            };
        }

        Ok(by_line.into_values().collect())
    }

    /// Per-line hour histogram for `date`: the stored `by_hour` map, with
    /// the current (possibly-incomplete) hour either replaced or added to
    /// depending on whether the aggregator has already covered it.
    pub async fn per_line_hour_breakdown(
        &self,
        date: NaiveDate,
        line: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<u32, HourBreakdown>> {
        let mut by_hour = self
            .aggregate_store
            .daily_line(date, line)
            .await?
            .map(|stat| stat.by_hour)
            .unwrap_or_default();

        let current_hour = now.hour();
        // The aggregate's current-hour entry, if any, reflects a run that
        // predates the raw tail scan below. If the aggregator has not yet
        // covered this hour at all, the tail *is* the hour's entire figure
        // so far, so the stale placeholder (if any) is cleared up front
        // rather than added to once per tail event.
        if date == now.date_naive() && !by_hour.contains_key(&current_hour) {
            by_hour.insert(current_hour, HourBreakdown::default());
        }

        for event in self.raw_tail(date, now).await? {
            if event.line.as_deref() != Some(line) {
                continue;
            }
            let hour = event.started_at.hour();
            let breakdown = by_hour.entry(hour).or_insert_with(HourBreakdown::default);
            breakdown.total_seconds += event.duration_seconds.unwrap_or(0);
            match event.classification {
                PersistedClassification::Delay => breakdown.delay_count += 1,
                PersistedClassification::Blockage => breakdown.blockage_count += 1,
            }
            if event.near_intersection {
                breakdown.intersection_delays += 1;
            }
        }

        Ok(by_hour)
    }

    /// Day-level summary across every line and intersection.
    pub async fn summary(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<DaySummary> {
        let hot_spots = self.hot_spots(date, now).await?;
        let lines_affected: BTreeSet<String> = hot_spots
            .iter()
            .flat_map(|spot| spot.lines.iter().cloned())
            .collect();

        let impacted = self.impacted_lines(date, now).await?;
        let total_delay_count = impacted.iter().map(|line| line.delay_count).sum();
        let total_blockage_count = impacted.iter().map(|line| line.blockage_count).sum();
        let total_seconds = impacted.iter().map(|line| line.total_seconds).sum();
        let total_cost_pln = hot_spots.iter().map(|spot| spot.cost_pln).sum();

        Ok(DaySummary {
            date,
            total_delay_count,
            total_blockage_count,
            total_seconds,
            total_cost_pln,
            lines_affected: lines_affected.len(),
        })
    }

    /// The all-time heatmap grid: served directly from the pattern table,
    /// no merge with raw data.
    pub async fn heatmap(&self) -> Result<Vec<HourlyPatternRow>> {
        Ok(self.aggregate_store.hourly_pattern().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator::fake::FakeAggregateStore;
    use chrono::TimeZone;
    use event_store::fake::FakeEventStore;
    use model::aggregate::{DailyIntersectionStat, DailyLineStat};
    use model::delay::NewDelayEvent;

    fn router(event_store: Arc<dyn EventStore>, aggregate_store: Arc<dyn AggregateStore>) -> QueryRouter {
        QueryRouter::new(event_store, aggregate_store)
    }

    /// Scenario S6's tail half: 30 aggregated events plus 2 raw tail events
    /// at the same bucket must merge into delay_count=32, total_seconds=980.
    #[tokio::test]
    async fn hot_spots_merge_the_aggregate_with_the_raw_tail() {
        let event_store: Arc<dyn EventStore> = Arc::new(FakeEventStore::new());
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let bucket = LocationBucket::new(52.2300, 21.0120);

        let mut daily = DailyIntersectionStat::empty(date, bucket);
        daily.delay_count = 30;
        daily.total_seconds = 900;
        daily.lines.insert("17".to_owned());
        aggregate_store.upsert_daily_intersection(daily).await.unwrap();

        // Two raw tail events in the 15:00-15:05 window, not yet aggregated.
        for _ in 0..2 {
            let started = Utc.with_ymd_and_hms(2025, 1, 7, 15, 1, 0).unwrap();
            let id = event_store
                .create(NewDelayEvent {
                    vehicle_id: "V1".to_owned(),
                    line: Some("17".to_owned()),
                    trip_id: None,
                    lat: 52.2300,
                    lon: 21.0120,
                    started_at: started,
                    classification: PersistedClassification::Delay,
                    at_stop: false,
                    near_intersection: true,
                })
                .await
                .unwrap();
            event_store
                .resolve(id, started + chrono::Duration::seconds(40))
                .await
                .unwrap();
        }

        let router = router(event_store, aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 7, 15, 4, 0).unwrap();
        let spots = router.hot_spots(date, now).await.unwrap();
        assert_eq!(spots.len(), 1);
        assert_eq!(spots[0].delay_count, 32);
        assert_eq!(spots[0].total_seconds, 980);
    }

    #[tokio::test]
    async fn impacted_lines_recomputes_the_average_after_the_merge() {
        let event_store: Arc<dyn EventStore> = Arc::new(FakeEventStore::new());
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();

        let mut daily = DailyLineStat::empty(date, "17".to_owned());
        daily.delay_count = 2;
        daily.total_seconds = 200;
        aggregate_store.upsert_daily_line(daily).await.unwrap();

        let router = router(event_store, aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 7, 23, 0, 0).unwrap();
        let lines = router.impacted_lines(date, now).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].average_seconds, 100.0);
    }

    /// Before the boundary's aggregator run for today has happened, the
    /// current hour's raw events become the whole figure for that hour
    /// rather than an addition on top of a stale placeholder.
    #[tokio::test]
    async fn per_line_hour_breakdown_builds_the_current_hour_fresh_from_the_tail() {
        let event_store: Arc<dyn EventStore> = Arc::new(FakeEventStore::new());
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();

        let started = Utc.with_ymd_and_hms(2025, 1, 7, 15, 1, 0).unwrap();
        let id = event_store
            .create(NewDelayEvent {
                vehicle_id: "V1".to_owned(),
                line: Some("17".to_owned()),
                trip_id: None,
                lat: 52.23,
                lon: 21.01,
                started_at: started,
                classification: PersistedClassification::Delay,
                at_stop: false,
                near_intersection: false,
            })
            .await
            .unwrap();
        event_store
            .resolve(id, started + chrono::Duration::seconds(40))
            .await
            .unwrap();

        let router = router(event_store, aggregate_store);
        let now = Utc.with_ymd_and_hms(2025, 1, 7, 15, 4, 0).unwrap();
        let breakdown = router.per_line_hour_breakdown(date, "17", now).await.unwrap();
        assert_eq!(breakdown.get(&15).unwrap().delay_count, 1);
        assert_eq!(breakdown.get(&15).unwrap().total_seconds, 40);
    }

    #[tokio::test]
    async fn heatmap_is_served_without_touching_the_event_store() {
        let event_store: Arc<dyn EventStore> = Arc::new(FakeEventStore::new());
        let aggregate_store: Arc<dyn AggregateStore> = Arc::new(FakeAggregateStore::new());
        aggregate_store
            .accumulate_hourly_pattern(vec![HourlyPatternRow {
                day_of_week: 1,
                hour: 8,
                delay_count: 5,
                blockage_count: 1,
            }])
            .await
            .unwrap();

        let router = router(event_store, aggregate_store);
        let rows = router.heatmap().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delay_count, 5);
    }
}
