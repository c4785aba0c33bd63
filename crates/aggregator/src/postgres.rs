use async_trait::async_trait;
use chrono::NaiveDate;
use model::aggregate::{DailyIntersectionStat, DailyLineStat, HourBreakdown, HourlyIntersectionStat, HourlyPatternRow, LocationBucket};
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;

use crate::{AggregateStore, AggregateStoreError, Result};

fn convert_error(why: sqlx::Error) -> AggregateStoreError {
    AggregateStoreError::Backend(Box::new(why))
}

fn lines_to_db(lines: &std::collections::BTreeSet<String>) -> Vec<String> {
    lines.iter().cloned().collect()
}

fn lines_from_db(lines: Vec<String>) -> std::collections::BTreeSet<String> {
    lines.into_iter().collect()
}

#[derive(FromRow)]
struct HourlyIntersectionRow {
    date: NaiveDate,
    hour: i32,
    lat_e4: i64,
    lon_e4: i64,
    delay_count: i64,
    multi_cycle_count: i64,
    total_seconds: i64,
    cost_pln: f64,
    lines: Vec<String>,
}

impl HourlyIntersectionRow {
    fn into_stat(self) -> HourlyIntersectionStat {
        HourlyIntersectionStat {
            date: self.date,
            hour: self.hour as u32,
            bucket: LocationBucket::new(
                self.lat_e4 as f64 / 10_000.0,
                self.lon_e4 as f64 / 10_000.0,
            ),
            delay_count: self.delay_count,
            multi_cycle_count: self.multi_cycle_count,
            total_seconds: self.total_seconds,
            cost_pln: self.cost_pln,
            lines: lines_from_db(self.lines),
        }
    }
}

#[derive(FromRow)]
struct DailyIntersectionRow {
    date: NaiveDate,
    lat_e4: i64,
    lon_e4: i64,
    delay_count: i64,
    multi_cycle_count: i64,
    total_seconds: i64,
    cost_pln: f64,
    lines: Vec<String>,
    nearest_stop_name: Option<String>,
}

impl DailyIntersectionRow {
    fn into_stat(self) -> DailyIntersectionStat {
        DailyIntersectionStat {
            date: self.date,
            bucket: LocationBucket::new(
                self.lat_e4 as f64 / 10_000.0,
                self.lon_e4 as f64 / 10_000.0,
            ),
            delay_count: self.delay_count,
            multi_cycle_count: self.multi_cycle_count,
            total_seconds: self.total_seconds,
            cost_pln: self.cost_pln,
            lines: lines_from_db(self.lines),
            nearest_stop_name: self.nearest_stop_name,
        }
    }
}

#[derive(FromRow)]
struct DailyLineRow {
    date: NaiveDate,
    line: String,
    delay_count: i64,
    blockage_count: i64,
    total_seconds: i64,
    intersection_count: i64,
    by_hour_json: serde_json::Value,
}

impl DailyLineRow {
    fn into_stat(self) -> DailyLineStat {
        let by_hour: BTreeMap<u32, HourBreakdown> =
            serde_json::from_value(self.by_hour_json).unwrap_or_default();
        DailyLineStat {
            date: self.date,
            line: self.line,
            delay_count: self.delay_count,
            blockage_count: self.blockage_count,
            total_seconds: self.total_seconds,
            intersection_count: self.intersection_count,
            by_hour,
        }
    }
}

pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn upsert_hourly_intersection(&self, stat: HourlyIntersectionStat) -> Result<()> {
        let lat_e4 = (stat.bucket.lat() * 10_000.0).round() as i64;
        let lon_e4 = (stat.bucket.lon() * 10_000.0).round() as i64;
        sqlx::query(
            "
            INSERT INTO hourly_intersection_stats(
                date, hour, lat_e4, lon_e4, delay_count, multi_cycle_count,
                total_seconds, cost_pln, lines
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (date, hour, lat_e4, lon_e4) DO UPDATE SET
                delay_count = EXCLUDED.delay_count,
                multi_cycle_count = EXCLUDED.multi_cycle_count,
                total_seconds = EXCLUDED.total_seconds,
                cost_pln = EXCLUDED.cost_pln,
                lines = EXCLUDED.lines;
            ",
        )
        .bind(stat.date)
        .bind(stat.hour as i32)
        .bind(lat_e4)
        .bind(lon_e4)
        .bind(stat.delay_count)
        .bind(stat.multi_cycle_count)
        .bind(stat.total_seconds)
        .bind(stat.cost_pln)
        .bind(lines_to_db(&stat.lines))
        .execute(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(())
    }

    async fn hourly_intersections(
        &self,
        date: NaiveDate,
        bucket: LocationBucket,
    ) -> Result<Vec<HourlyIntersectionStat>> {
        let lat_e4 = (bucket.lat() * 10_000.0).round() as i64;
        let lon_e4 = (bucket.lon() * 10_000.0).round() as i64;
        let rows: Vec<HourlyIntersectionRow> = sqlx::query_as(
            "
            SELECT date, hour, lat_e4, lon_e4, delay_count, multi_cycle_count,
                   total_seconds, cost_pln, lines
            FROM hourly_intersection_stats
            WHERE date = $1 AND lat_e4 = $2 AND lon_e4 = $3;
            ",
        )
        .bind(date)
        .bind(lat_e4)
        .bind(lon_e4)
        .fetch_all(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(rows.into_iter().map(HourlyIntersectionRow::into_stat).collect())
    }

    async fn upsert_daily_intersection(&self, stat: DailyIntersectionStat) -> Result<()> {
        let lat_e4 = (stat.bucket.lat() * 10_000.0).round() as i64;
        let lon_e4 = (stat.bucket.lon() * 10_000.0).round() as i64;
        sqlx::query(
            "
            INSERT INTO daily_intersection_stats(
                date, lat_e4, lon_e4, delay_count, multi_cycle_count,
                total_seconds, cost_pln, lines, nearest_stop_name
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (date, lat_e4, lon_e4) DO UPDATE SET
                delay_count = EXCLUDED.delay_count,
                multi_cycle_count = EXCLUDED.multi_cycle_count,
                total_seconds = EXCLUDED.total_seconds,
                cost_pln = EXCLUDED.cost_pln,
                lines = EXCLUDED.lines,
                nearest_stop_name = EXCLUDED.nearest_stop_name;
            ",
        )
        .bind(stat.date)
        .bind(lat_e4)
        .bind(lon_e4)
        .bind(stat.delay_count)
        .bind(stat.multi_cycle_count)
        .bind(stat.total_seconds)
        .bind(stat.cost_pln)
        .bind(lines_to_db(&stat.lines))
        .bind(stat.nearest_stop_name)
        .execute(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(())
    }

    async fn daily_intersections(&self, date: NaiveDate) -> Result<Vec<DailyIntersectionStat>> {
        let rows: Vec<DailyIntersectionRow> = sqlx::query_as(
            "
            SELECT date, lat_e4, lon_e4, delay_count, multi_cycle_count,
                   total_seconds, cost_pln, lines, nearest_stop_name
            FROM daily_intersection_stats
            WHERE date = $1;
            ",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(rows.into_iter().map(DailyIntersectionRow::into_stat).collect())
    }

    async fn daily_line(&self, date: NaiveDate, line: &str) -> Result<Option<DailyLineStat>> {
        let row: Option<DailyLineRow> = sqlx::query_as(
            "
            SELECT date, line, delay_count, blockage_count, total_seconds,
                   intersection_count, by_hour_json
            FROM daily_line_stats
            WHERE date = $1 AND line = $2;
            ",
        )
        .bind(date)
        .bind(line)
        .fetch_optional(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(row.map(DailyLineRow::into_stat))
    }

    async fn upsert_daily_line(&self, stat: DailyLineStat) -> Result<()> {
        let by_hour_json = serde_json::to_value(&stat.by_hour)
            .map_err(|why| AggregateStoreError::Backend(Box::new(why)))?;
        sqlx::query(
            "
            INSERT INTO daily_line_stats(
                date, line, delay_count, blockage_count, total_seconds,
                intersection_count, by_hour_json
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (date, line) DO UPDATE SET
                delay_count = EXCLUDED.delay_count,
                blockage_count = EXCLUDED.blockage_count,
                total_seconds = EXCLUDED.total_seconds,
                intersection_count = EXCLUDED.intersection_count,
                by_hour_json = EXCLUDED.by_hour_json;
            ",
        )
        .bind(stat.date)
        .bind(&stat.line)
        .bind(stat.delay_count)
        .bind(stat.blockage_count)
        .bind(stat.total_seconds)
        .bind(stat.intersection_count)
        .bind(by_hour_json)
        .execute(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(())
    }

    async fn daily_lines(&self, date: NaiveDate) -> Result<Vec<DailyLineStat>> {
        let rows: Vec<DailyLineRow> = sqlx::query_as(
            "
            SELECT date, line, delay_count, blockage_count, total_seconds,
                   intersection_count, by_hour_json
            FROM daily_line_stats
            WHERE date = $1;
            ",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(rows.into_iter().map(DailyLineRow::into_stat).collect())
    }

    async fn hourly_pattern(&self) -> Result<Vec<HourlyPatternRow>> {
        let rows: Vec<(i16, i32, i64, i64)> = sqlx::query_as(
            "SELECT day_of_week, hour, delay_count, blockage_count FROM hourly_pattern;",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(rows
            .into_iter()
            .map(|(day_of_week, hour, delay_count, blockage_count)| HourlyPatternRow {
                day_of_week: day_of_week as u8,
                hour: hour as u32,
                delay_count,
                blockage_count,
            })
            .collect())
    }

    async fn accumulate_hourly_pattern(&self, rows: Vec<HourlyPatternRow>) -> Result<()> {
        for row in rows {
            sqlx::query(
                "
                INSERT INTO hourly_pattern(day_of_week, hour, delay_count, blockage_count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (day_of_week, hour) DO UPDATE SET
                    delay_count = hourly_pattern.delay_count + EXCLUDED.delay_count,
                    blockage_count = hourly_pattern.blockage_count + EXCLUDED.blockage_count;
                ",
            )
            .bind(row.day_of_week as i16)
            .bind(row.hour as i32)
            .bind(row.delay_count)
            .bind(row.blockage_count)
            .execute(&self.pool)
            .await
            .map_err(convert_error)?;
        }
        Ok(())
    }

    async fn mark_hour_aggregated(&self, date: NaiveDate, hour: u32) -> Result<()> {
        sqlx::query(
            "
            INSERT INTO aggregated_hours(date, hour)
            VALUES ($1, $2)
            ON CONFLICT (date, hour) DO NOTHING;
            ",
        )
        .bind(date)
        .bind(hour as i32)
        .execute(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(())
    }

    async fn is_hour_aggregated(&self, date: NaiveDate, hour: u32) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT hour FROM aggregated_hours WHERE date = $1 AND hour = $2;",
        )
        .bind(date)
        .bind(hour as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(row.is_some())
    }

    async fn last_aggregated_hour(&self) -> Result<Option<(NaiveDate, u32)>> {
        let row: Option<(NaiveDate, i32)> = sqlx::query_as(
            "
            SELECT date, hour FROM aggregated_hours
            ORDER BY date DESC, hour DESC
            LIMIT 1;
            ",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(convert_error)?;
        Ok(row.map(|(date, hour)| (date, hour as u32)))
    }
}
