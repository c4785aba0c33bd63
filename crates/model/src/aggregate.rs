use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use util::geo::round_coordinate;

/// Number of decimal places locations are rounded to before being used as
/// aggregation keys: 4 places is ~11m.
pub const BUCKET_DECIMAL_PLACES: u32 = 4;

/// A hashable, orderable key for a rounded `(lat, lon)` pair. Coordinates are
/// stored scaled by 10^4 so the key has exact equality semantics, unlike raw
/// `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationBucket {
    lat_e4: i64,
    lon_e4: i64,
}

impl LocationBucket {
    pub fn new(lat: f64, lon: f64) -> Self {
        let scale = 10f64.powi(BUCKET_DECIMAL_PLACES as i32);
        Self {
            lat_e4: (lat * scale).round() as i64,
            lon_e4: (lon * scale).round() as i64,
        }
    }

    pub fn lat(&self) -> f64 {
        round_coordinate(self.lat_e4 as f64 / 10f64.powi(BUCKET_DECIMAL_PLACES as i32), BUCKET_DECIMAL_PLACES)
    }

    pub fn lon(&self) -> f64 {
        round_coordinate(self.lon_e4 as f64 / 10f64.powi(BUCKET_DECIMAL_PLACES as i32), BUCKET_DECIMAL_PLACES)
    }
}

/// Per-(date, hour, location) aggregate. Upserted with replace semantics so
/// re-running a closed hour is idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyIntersectionStat {
    pub date: NaiveDate,
    pub hour: u32,
    pub bucket: LocationBucket,
    pub delay_count: i64,
    pub multi_cycle_count: i64,
    pub total_seconds: i64,
    pub cost_pln: f64,
    pub lines: BTreeSet<String>,
}

impl HourlyIntersectionStat {
    pub fn empty(date: NaiveDate, hour: u32, bucket: LocationBucket) -> Self {
        Self {
            date,
            hour,
            bucket,
            delay_count: 0,
            multi_cycle_count: 0,
            total_seconds: 0,
            cost_pln: 0.0,
            lines: BTreeSet::new(),
        }
    }
}

/// Additive per-(date, location) roll-up of the day's hourly stats.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyIntersectionStat {
    pub date: NaiveDate,
    pub bucket: LocationBucket,
    pub delay_count: i64,
    pub multi_cycle_count: i64,
    pub total_seconds: i64,
    pub cost_pln: f64,
    pub lines: BTreeSet<String>,
    pub nearest_stop_name: Option<String>,
}

impl DailyIntersectionStat {
    pub fn empty(date: NaiveDate, bucket: LocationBucket) -> Self {
        Self {
            date,
            bucket,
            delay_count: 0,
            multi_cycle_count: 0,
            total_seconds: 0,
            cost_pln: 0.0,
            lines: BTreeSet::new(),
            nearest_stop_name: None,
        }
    }

    pub fn add_hour(&mut self, hour: &HourlyIntersectionStat) {
        self.delay_count += hour.delay_count;
        self.multi_cycle_count += hour.multi_cycle_count;
        self.total_seconds += hour.total_seconds;
        self.cost_pln += hour.cost_pln;
        self.lines.extend(hour.lines.iter().cloned());
    }
}

/// Per-hour breakdown nested inside `DailyLineStat`, modelled as a fixed
/// struct keyed by integer hour rather than a nested string-keyed map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HourBreakdown {
    pub delay_count: i64,
    pub blockage_count: i64,
    pub total_seconds: i64,
    pub intersection_delays: i64,
}

/// Per-(date, line) aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyLineStat {
    pub date: NaiveDate,
    pub line: String,
    pub delay_count: i64,
    pub blockage_count: i64,
    pub total_seconds: i64,
    pub intersection_count: i64,
    pub by_hour: BTreeMap<u32, HourBreakdown>,
}

impl DailyLineStat {
    pub fn empty(date: NaiveDate, line: String) -> Self {
        Self {
            date,
            line,
            delay_count: 0,
            blockage_count: 0,
            total_seconds: 0,
            intersection_count: 0,
            by_hour: BTreeMap::new(),
        }
    }
}

/// Fixed 168-row (7 days * 24 hours) all-time-history counter table, never
/// used for windowed queries, only the heatmap grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HourlyPatternRow {
    pub day_of_week: u8,
    pub hour: u32,
    pub delay_count: i64,
    pub blockage_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_bucket_round_trips_through_rounding() {
        let bucket = LocationBucket::new(52.230049, 21.012051);
        assert_eq!(bucket.lat(), 52.2300);
        assert_eq!(bucket.lon(), 21.0121);
    }

    #[test]
    fn equal_buckets_hash_and_compare_equal() {
        let a = LocationBucket::new(52.2300, 21.0120);
        let b = LocationBucket::new(52.23004, 21.01204);
        assert_eq!(a, b);
    }

    #[test]
    fn daily_stat_accumulates_additively() {
        let bucket = LocationBucket::new(52.23, 21.01);
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let mut daily = DailyIntersectionStat::empty(date, bucket);
        let mut hour = HourlyIntersectionStat::empty(date, 14, bucket);
        hour.delay_count = 30;
        hour.total_seconds = 900;
        hour.lines.insert("17".to_owned());
        daily.add_hour(&hour);
        daily.add_hour(&hour);
        assert_eq!(daily.delay_count, 60);
        assert_eq!(daily.total_seconds, 1800);
        assert_eq!(daily.lines.len(), 1);
    }
}
