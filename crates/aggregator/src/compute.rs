//! Pure computation behind a closed hour's aggregates. Kept free of any
//! store so the numbers can be checked directly against worked examples.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use model::aggregate::{
    DailyLineStat, HourBreakdown, HourlyIntersectionStat, HourlyPatternRow, LocationBucket,
};
use model::cost::{cost_pln, CostConfig};
use model::delay::{DelayEvent, PersistedClassification};

pub struct HourAggregation {
    pub intersections: Vec<HourlyIntersectionStat>,
    pub line_breakdowns: BTreeMap<String, HourBreakdown>,
    pub pattern_rows: Vec<HourlyPatternRow>,
}

/// Folds a closed hour's resolved events into per-location and per-line
/// breakdowns, plus the all-time pattern deltas for that hour.
pub fn aggregate_hour(
    date: NaiveDate,
    hour: u32,
    day_of_week: u8,
    events: &[DelayEvent],
    cost_config: &CostConfig,
) -> HourAggregation {
    let mut by_bucket: BTreeMap<LocationBucket, HourlyIntersectionStat> = BTreeMap::new();
    let mut by_line: BTreeMap<String, HourBreakdown> = BTreeMap::new();
    let mut pattern = HourlyPatternRow {
        day_of_week,
        hour,
        delay_count: 0,
        blockage_count: 0,
    };

    for event in events {
        let duration_seconds = event.duration_seconds.unwrap_or(0);

        if event.near_intersection {
            let bucket = LocationBucket::new(event.lat, event.lon);
            let cost = cost_pln(duration_seconds, hour, cost_config);

            let stat = by_bucket
                .entry(bucket)
                .or_insert_with(|| HourlyIntersectionStat::empty(date, hour, bucket));
            stat.delay_count += 1;
            if event.multi_cycle {
                stat.multi_cycle_count += 1;
            }
            stat.total_seconds += duration_seconds;
            stat.cost_pln += cost;
            if let Some(line) = &event.line {
                stat.lines.insert(line.clone());
            }
        }

        if let Some(line) = &event.line {
            let breakdown = by_line.entry(line.clone()).or_insert_with(HourBreakdown::default);
            breakdown.total_seconds += duration_seconds;
            match event.classification {
                PersistedClassification::Delay => breakdown.delay_count += 1,
                PersistedClassification::Blockage => breakdown.blockage_count += 1,
            }
            if event.near_intersection {
                breakdown.intersection_delays += 1;
            }
        }

        match event.classification {
            PersistedClassification::Delay => pattern.delay_count += 1,
            PersistedClassification::Blockage => pattern.blockage_count += 1,
        }
    }

    HourAggregation {
        intersections: by_bucket.into_values().collect(),
        line_breakdowns: by_line,
        pattern_rows: vec![pattern],
    }
}

/// Merges a hour's line breakdown into a `DailyLineStat`, replacing (not
/// adding to) that hour's entry so re-running an hour stays idempotent, then
/// recomputes the daily totals as the sum over all stored hours.
pub fn apply_hour_to_daily_line(
    mut daily: DailyLineStat,
    hour: u32,
    breakdown: HourBreakdown,
) -> DailyLineStat {
    daily.by_hour.insert(hour, breakdown);

    daily.delay_count = daily.by_hour.values().map(|b| b.delay_count).sum();
    daily.blockage_count = daily.by_hour.values().map(|b| b.blockage_count).sum();
    daily.total_seconds = daily.by_hour.values().map(|b| b.total_seconds).sum();
    daily.intersection_count = daily.by_hour.values().map(|b| b.intersection_delays).sum();
    daily
}

/// Recomputes a day's intersection totals from scratch given every hourly
/// row stored for that `(date, bucket)`, so re-running an hour is an
/// idempotent replace rather than a double-count.
pub fn daily_intersection_from_hours(
    date: NaiveDate,
    bucket: LocationBucket,
    hours: &[HourlyIntersectionStat],
    nearest_stop_name: Option<String>,
) -> model::aggregate::DailyIntersectionStat {
    let mut daily = model::aggregate::DailyIntersectionStat::empty(date, bucket);
    daily.nearest_stop_name = nearest_stop_name;
    for hour in hours {
        daily.add_hour(hour);
    }
    daily
}

/// The next UTC instant at minute 5 of an hour, strictly after `now`.
pub fn next_fire_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now
        .date_naive()
        .and_hms_opt(now.hour(), 5, 0)
        .expect("minute 5, second 0 is always a valid time")
        .and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::hours(1)
    }
}

/// The start of the earliest hour the aggregate store is not yet expected
/// to cover: "minute 5 of the current hour" once that minute has passed,
/// otherwise the start of the previous hour. The query router's raw tail
/// begins here; everything before it should already be in the aggregate
/// store.
pub fn tail_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let current_hour_start = now
        .date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("hour, 0, 0 is always valid")
        .and_utc();
    if now.minute() >= 5 {
        current_hour_start
    } else {
        current_hour_start - chrono::Duration::hours(1)
    }
}

/// The most recently fully-closed hour relative to `now`: the hour
/// immediately preceding `tail_boundary`.
pub fn previous_closed_hour(now: DateTime<Utc>) -> (NaiveDate, u32) {
    let closed = tail_boundary(now) - chrono::Duration::hours(1);
    (closed.date_naive(), closed.hour())
}

pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}
