//! Wires `EventStore` + `AggregateStore` together into the periodic job
//! that closes out an hour.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{NaiveDate, Utc};
use event_store::EventStore;
use futures::FutureExt;
use model::aggregate::DailyLineStat;
use model::cost::CostConfig;
use reference_store::ReferenceStore;

use crate::compute::{
    aggregate_hour, apply_hour_to_daily_line, daily_intersection_from_hours, day_of_week,
    next_fire_after, previous_closed_hour,
};
use crate::{AggregateStore, Result};

pub struct Aggregator {
    event_store: Arc<dyn EventStore>,
    aggregate_store: Arc<dyn AggregateStore>,
    reference_store: Arc<dyn ReferenceStore>,
    cost_config: CostConfig,
}

impl Aggregator {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        aggregate_store: Arc<dyn AggregateStore>,
        reference_store: Arc<dyn ReferenceStore>,
        cost_config: CostConfig,
    ) -> Self {
        Self {
            event_store,
            aggregate_store,
            reference_store,
            cost_config,
        }
    }

    /// Closes a single hour: scans the resolved events that started in it,
    /// folds them into the hourly/daily/pattern roll-ups, and marks the hour
    /// aggregated. Safe to call more than once for the same hour: every
    /// write here is either a full replace or a from-scratch recompute,
    /// except the pattern increment, which the `is_hour_aggregated` guard
    /// lets through only the first time.
    pub async fn run_for_hour(&self, date: NaiveDate, hour: u32) -> Result<()> {
        let from = date
            .and_hms_opt(hour, 0, 0)
            .expect("hour is always a valid time component")
            .and_utc();
        let to = from + chrono::Duration::hours(1);

        let events = self
            .event_store
            .scan(from, to)
            .await
            .map_err(|why| crate::AggregateStoreError::Backend(Box::new(why)))?;

        let already_aggregated = self.aggregate_store.is_hour_aggregated(date, hour).await?;
        let aggregation = aggregate_hour(date, hour, day_of_week(date), &events, &self.cost_config);

        for stat in &aggregation.intersections {
            self.aggregate_store
                .upsert_hourly_intersection(stat.clone())
                .await?;

            let hours = self
                .aggregate_store
                .hourly_intersections(date, stat.bucket)
                .await?;
            let nearest_stop_name = self
                .reference_store
                .nearest_stop_name(stat.bucket.lat(), stat.bucket.lon())
                .await;
            let daily = daily_intersection_from_hours(date, stat.bucket, &hours, nearest_stop_name);
            self.aggregate_store.upsert_daily_intersection(daily).await?;
        }

        for (line, breakdown) in &aggregation.line_breakdowns {
            let daily = self
                .aggregate_store
                .daily_line(date, line)
                .await?
                .unwrap_or_else(|| DailyLineStat::empty(date, line.clone()));
            let daily = apply_hour_to_daily_line(daily, hour, *breakdown);
            self.aggregate_store.upsert_daily_line(daily).await?;
        }

        if !already_aggregated {
            self.aggregate_store
                .accumulate_hourly_pattern(aggregation.pattern_rows)
                .await?;
        }

        self.aggregate_store.mark_hour_aggregated(date, hour).await?;
        Ok(())
    }

    /// Aggregates every closed hour since the last one marked aggregated, up
    /// to (and including) the current hour's predecessor. Run on startup so
    /// a restart does not leave a gap in the roll-ups.
    pub async fn catch_up(&self) -> Result<usize> {
        let (target_date, target_hour) = previous_closed_hour(Utc::now());
        let mut cursor = match self.aggregate_store.last_aggregated_hour().await? {
            Some((date, hour)) => next_hour(date, hour),
            None => (target_date, target_hour),
        };

        let mut ran = 0;
        while cursor <= (target_date, target_hour) {
            self.run_for_hour(cursor.0, cursor.1).await?;
            ran += 1;
            cursor = next_hour(cursor.0, cursor.1);
        }
        Ok(ran)
    }

    /// Runs `catch_up`, then fires once every hour at minute 5, catching
    /// panics and retrying rather than letting one bad hour stop the loop.
    pub fn run_scheduled(aggregator: Arc<Aggregator>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(why) = aggregator.catch_up().await {
                log::error!("aggregator catch-up failed: {why}");
            }

            loop {
                let now = Utc::now();
                let next_fire = next_fire_after(now);
                let sleep_for = (next_fire - now)
                    .to_std()
                    .unwrap_or(StdDuration::from_secs(60));
                tokio::time::sleep(sleep_for).await;

                let result = AssertUnwindSafe(aggregator.catch_up()).catch_unwind().await;
                match result {
                    Ok(Ok(ran)) => log::debug!("aggregator closed {ran} hour(s)"),
                    Ok(Err(why)) => log::error!("aggregator run failed: {why}"),
                    Err(why) => log::error!("aggregator run panicked: {why:?}"),
                }
            }
        })
    }
}

fn next_hour(date: NaiveDate, hour: u32) -> (NaiveDate, u32) {
    if hour == 23 {
        (date.succ_opt().expect("dates do not overflow in practice"), 0)
    } else {
        (date, hour + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeAggregateStore;
    use chrono::TimeZone;
    use event_store::fake::FakeEventStore;
    use model::delay::{NewDelayEvent, PersistedClassification};
    use reference_store::fake::FakeReferenceStore;

    fn aggregator(event_store: Arc<dyn EventStore>, aggregate_store: Arc<dyn AggregateStore>) -> Aggregator {
        Aggregator::new(
            event_store,
            aggregate_store,
            Arc::new(FakeReferenceStore::new()),
            CostConfig::default(),
        )
    }

    /// A single peak-hour delay is aggregated into one intersection stat
    /// with the worked cost, and re-running the same hour afterwards leaves
    /// the stored totals unchanged.
    #[tokio::test]
    async fn running_the_same_hour_twice_does_not_change_totals() {
        let event_store: Arc<dyn EventStore> = Arc::new(FakeEventStore::new());
        let aggregate_store = Arc::new(FakeAggregateStore::new());
        let aggregator = aggregator(event_store.clone(), aggregate_store.clone());

        let started = Utc.with_ymd_and_hms(2025, 1, 7, 8, 0, 0).unwrap();
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
                near_intersection: true,
            })
            .await
            .unwrap();
        event_store
            .resolve(id, started + chrono::Duration::seconds(900))
            .await
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        aggregator.run_for_hour(date, 8).await.unwrap();

        let bucket = model::aggregate::LocationBucket::new(52.23, 21.01);
        let first_pass = aggregate_store.hourly_intersections(date, bucket).await.unwrap();
        assert_eq!(first_pass.len(), 1);
        assert!((first_pass[0].cost_pln - 846.25).abs() < 1e-6);

        aggregator.run_for_hour(date, 8).await.unwrap();
        let second_pass = aggregate_store.hourly_intersections(date, bucket).await.unwrap();
        assert_eq!(second_pass.len(), 1);
        assert_eq!(second_pass[0].delay_count, first_pass[0].delay_count);
        assert!((second_pass[0].cost_pln - first_pass[0].cost_pln).abs() < 1e-6);

        let daily_line = aggregate_store.daily_line(date, "17").await.unwrap().unwrap();
        assert_eq!(daily_line.delay_count, 1);

        // Pattern increment only applies once across both runs.
        let patterns = aggregate_store.all_patterns();
        let row = patterns
            .iter()
            .find(|row| row.hour == 8 && row.day_of_week == day_of_week(date))
            .unwrap();
        assert_eq!(row.delay_count, 1);
    }

    #[tokio::test]
    async fn catch_up_with_no_prior_watermark_closes_only_the_last_hour() {
        let event_store: Arc<dyn EventStore> = Arc::new(FakeEventStore::new());
        let aggregate_store = Arc::new(FakeAggregateStore::new());
        let aggregator = aggregator(event_store, aggregate_store.clone());
        let ran = aggregator.catch_up().await.unwrap();
        assert_eq!(ran, 1);
        assert!(aggregate_store.last_aggregated_hour().await.unwrap().is_some());
    }
}
