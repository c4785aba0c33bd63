use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use model::aggregate::{DailyIntersectionStat, DailyLineStat, HourlyIntersectionStat, HourlyPatternRow, LocationBucket};

use crate::{AggregateStore, Result};

#[derive(Default)]
struct Inner {
    hourly_intersections: Vec<HourlyIntersectionStat>,
    daily_intersections: HashMap<(NaiveDate, LocationBucket), DailyIntersectionStat>,
    daily_lines: HashMap<(NaiveDate, String), DailyLineStat>,
    patterns: HashMap<(u8, u32), HourlyPatternRow>,
    aggregated_hours: BTreeSet<(NaiveDate, u32)>,
}

/// In-memory `AggregateStore` used by aggregator and query-router tests.
pub struct FakeAggregateStore {
    inner: RwLock<Inner>,
}

impl FakeAggregateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn all_hourly_intersections(&self) -> Vec<HourlyIntersectionStat> {
        self.inner.read().unwrap().hourly_intersections.clone()
    }

    pub fn all_patterns(&self) -> Vec<HourlyPatternRow> {
        self.inner.read().unwrap().patterns.values().cloned().collect()
    }
}

impl Default for FakeAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregateStore for FakeAggregateStore {
    async fn upsert_hourly_intersection(&self, stat: HourlyIntersectionStat) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .hourly_intersections
            .retain(|existing| !(existing.date == stat.date && existing.hour == stat.hour && existing.bucket == stat.bucket));
        inner.hourly_intersections.push(stat);
        Ok(())
    }

    async fn hourly_intersections(
        &self,
        date: NaiveDate,
        bucket: LocationBucket,
    ) -> Result<Vec<HourlyIntersectionStat>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .hourly_intersections
            .iter()
            .filter(|stat| stat.date == date && stat.bucket == bucket)
            .cloned()
            .collect())
    }

    async fn upsert_daily_intersection(&self, stat: DailyIntersectionStat) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.daily_intersections.insert((stat.date, stat.bucket), stat);
        Ok(())
    }

    async fn daily_intersections(&self, date: NaiveDate) -> Result<Vec<DailyIntersectionStat>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .daily_intersections
            .values()
            .filter(|stat| stat.date == date)
            .cloned()
            .collect())
    }

    async fn daily_line(&self, date: NaiveDate, line: &str) -> Result<Option<DailyLineStat>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.daily_lines.get(&(date, line.to_owned())).cloned())
    }

    async fn daily_lines(&self, date: NaiveDate) -> Result<Vec<DailyLineStat>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .daily_lines
            .values()
            .filter(|stat| stat.date == date)
            .cloned()
            .collect())
    }

    async fn upsert_daily_line(&self, stat: DailyLineStat) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.daily_lines.insert((stat.date, stat.line.clone()), stat);
        Ok(())
    }

    async fn hourly_pattern(&self) -> Result<Vec<HourlyPatternRow>> {
        Ok(self.inner.read().unwrap().patterns.values().cloned().collect())
    }

    async fn accumulate_hourly_pattern(&self, rows: Vec<HourlyPatternRow>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for row in rows {
            let entry = inner
                .patterns
                .entry((row.day_of_week, row.hour))
                .or_insert_with(|| HourlyPatternRow {
                    day_of_week: row.day_of_week,
                    hour: row.hour,
                    delay_count: 0,
                    blockage_count: 0,
                });
            entry.delay_count += row.delay_count;
            entry.blockage_count += row.blockage_count;
        }
        Ok(())
    }

    async fn mark_hour_aggregated(&self, date: NaiveDate, hour: u32) -> Result<()> {
        self.inner.write().unwrap().aggregated_hours.insert((date, hour));
        Ok(())
    }

    async fn is_hour_aggregated(&self, date: NaiveDate, hour: u32) -> Result<bool> {
        Ok(self.inner.read().unwrap().aggregated_hours.contains(&(date, hour)))
    }

    async fn last_aggregated_hour(&self) -> Result<Option<(NaiveDate, u32)>> {
        Ok(self.inner.read().unwrap().aggregated_hours.iter().next_back().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upserting_the_same_hour_twice_replaces_rather_than_duplicates() {
        let store = FakeAggregateStore::new();
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let bucket = LocationBucket::new(52.23, 21.01);

        let mut stat = HourlyIntersectionStat::empty(date, 8, bucket);
        stat.delay_count = 3;
        store.upsert_hourly_intersection(stat.clone()).await.unwrap();

        stat.delay_count = 5;
        store.upsert_hourly_intersection(stat).await.unwrap();

        let rows = store.hourly_intersections(date, bucket).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delay_count, 5);
    }

    #[tokio::test]
    async fn hour_aggregated_sentinel_round_trips() {
        let store = FakeAggregateStore::new();
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        assert!(!store.is_hour_aggregated(date, 8).await.unwrap());
        store.mark_hour_aggregated(date, 8).await.unwrap();
        assert!(store.is_hour_aggregated(date, 8).await.unwrap());
        assert_eq!(store.last_aggregated_hour().await.unwrap(), Some((date, 8)));
    }

    #[tokio::test]
    async fn accumulating_pattern_rows_adds_across_calls() {
        let store = FakeAggregateStore::new();
        let row = HourlyPatternRow {
            day_of_week: 1,
            hour: 8,
            delay_count: 2,
            blockage_count: 1,
        };
        store.accumulate_hourly_pattern(vec![row]).await.unwrap();
        store.accumulate_hourly_pattern(vec![row]).await.unwrap();

        let stored = store.all_patterns();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delay_count, 4);
    }
}
