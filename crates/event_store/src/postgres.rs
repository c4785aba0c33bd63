use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use model::delay::{is_multi_cycle, DelayEvent, NewDelayEvent, PersistedClassification};
use sqlx::{FromRow, PgPool};
use util::id::Id;

use crate::{EventStore, EventStoreError, Result};

fn convert_error(why: sqlx::Error) -> EventStoreError {
    EventStoreError::Backend(Box::new(why))
}

#[derive(Debug, Clone, FromRow)]
struct DelayEventRow {
    id: i64,
    vehicle_id: String,
    line: Option<String>,
    trip_id: Option<String>,
    lat: f64,
    lon: f64,
    started_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    classification: String,
    at_stop: bool,
    near_intersection: bool,
    multi_cycle: bool,
}

impl DelayEventRow {
    fn into_event(self) -> Result<DelayEvent> {
        let classification = PersistedClassification::from_db_str(&self.classification)
            .ok_or_else(|| EventStoreError::Backend("unknown classification in row".into()))?;
        Ok(DelayEvent {
            vehicle_id: self.vehicle_id,
            line: self.line,
            trip_id: self.trip_id,
            lat: self.lat,
            lon: self.lon,
            started_at: self.started_at,
            resolved_at: self.resolved_at,
            duration_seconds: self.duration_seconds,
            classification,
            at_stop: self.at_stop,
            near_intersection: self.near_intersection,
            multi_cycle: self.multi_cycle,
        })
    }
}

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create(&self, event: NewDelayEvent) -> Result<Id<DelayEvent>> {
        let row: (i64,) = sqlx::query_as(
            "
            INSERT INTO delay_events(
                vehicle_id, line, trip_id, lat, lon, started_at,
                classification, at_stop, near_intersection, multi_cycle
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, false)
            RETURNING id;
            ",
        )
        .bind(&event.vehicle_id)
        .bind(&event.line)
        .bind(&event.trip_id)
        .bind(event.lat)
        .bind(event.lon)
        .bind(event.started_at)
        .bind(event.classification.as_db_str())
        .bind(event.at_stop)
        .bind(event.near_intersection)
        .fetch_one(&self.pool)
        .await
        .map_err(convert_error)?;

        Ok(Id::new(row.0))
    }

    async fn get(&self, id: Id<DelayEvent>) -> Result<DelayEvent> {
        sqlx::query_as(
            "
            SELECT
                id, vehicle_id, line, trip_id, lat, lon, started_at,
                resolved_at, duration_seconds, classification, at_stop,
                near_intersection, multi_cycle
            FROM delay_events
            WHERE id = $1;
            ",
        )
        .bind(id.raw())
        .fetch_optional(&self.pool)
        .await
        .map_err(convert_error)?
        .ok_or(EventStoreError::NotFound)
        .and_then(DelayEventRow::into_event)
    }

    async fn resolve(&self, id: Id<DelayEvent>, resolved_at: DateTime<Utc>) -> Result<DelayEvent> {
        let row: DelayEventRow = sqlx::query_as(
            "
            SELECT
                id, vehicle_id, line, trip_id, lat, lon, started_at,
                resolved_at, duration_seconds, classification, at_stop,
                near_intersection, multi_cycle
            FROM delay_events
            WHERE id = $1;
            ",
        )
        .bind(id.raw())
        .fetch_optional(&self.pool)
        .await
        .map_err(convert_error)?
        .ok_or(EventStoreError::NotFound)?;

        if row.resolved_at.is_some() {
            return Err(EventStoreError::Backend("already resolved".into()));
        }

        let duration_seconds = (resolved_at - row.started_at).num_seconds();
        let multi_cycle = is_multi_cycle(duration_seconds, row.near_intersection);

        sqlx::query_as(
            "
            UPDATE delay_events
            SET resolved_at = $1, duration_seconds = $2, multi_cycle = $3
            WHERE id = $4
            RETURNING
                id, vehicle_id, line, trip_id, lat, lon, started_at,
                resolved_at, duration_seconds, classification, at_stop,
                near_intersection, multi_cycle;
            ",
        )
        .bind(resolved_at)
        .bind(duration_seconds)
        .bind(multi_cycle)
        .bind(id.raw())
        .fetch_one(&self.pool)
        .await
        .map_err(convert_error)
        .and_then(DelayEventRow::into_event)
    }

    async fn find_unresolved_by_vehicle(&self, vehicle_id: &str) -> Result<Option<DelayEvent>> {
        let row: Option<DelayEventRow> = sqlx::query_as(
            "
            SELECT
                id, vehicle_id, line, trip_id, lat, lon, started_at,
                resolved_at, duration_seconds, classification, at_stop,
                near_intersection, multi_cycle
            FROM delay_events
            WHERE vehicle_id = $1 AND resolved_at IS NULL;
            ",
        )
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(convert_error)?;

        row.map(DelayEventRow::into_event).transpose()
    }

    async fn delete_orphans_unresolved(&self, vehicle_id: &str) -> Result<u64> {
        sqlx::query(
            "
            DELETE FROM delay_events
            WHERE vehicle_id = $1 AND resolved_at IS NULL;
            ",
        )
        .bind(vehicle_id)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
        .map_err(convert_error)
    }

    async fn list_unresolved_vehicle_ids(&self) -> Result<Vec<String>> {
        sqlx::query_as(
            "
            SELECT DISTINCT vehicle_id
            FROM delay_events
            WHERE resolved_at IS NULL;
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map(|rows: Vec<(String,)>| rows.into_iter().map(|(id,)| id).collect())
        .map_err(convert_error)
    }

    async fn scan(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DelayEvent>> {
        sqlx::query_as(
            "
            SELECT
                id, vehicle_id, line, trip_id, lat, lon, started_at,
                resolved_at, duration_seconds, classification, at_stop,
                near_intersection, multi_cycle
            FROM delay_events
            WHERE resolved_at IS NOT NULL
              AND started_at >= $1 AND started_at < $2;
            ",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(convert_error)?
        .into_iter()
        .map(DelayEventRow::into_event)
        .collect()
    }

    async fn delete_for_date(&self, date: NaiveDate) -> Result<u64> {
        sqlx::query(
            "
            DELETE FROM delay_events
            WHERE started_at::date = $1;
            ",
        )
        .bind(date)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
        .map_err(convert_error)
    }

    async fn dates_with_events_before(&self, cutoff: NaiveDate) -> Result<Vec<NaiveDate>> {
        sqlx::query_as(
            "
            SELECT DISTINCT started_at::date AS date
            FROM delay_events
            WHERE started_at::date < $1
            ORDER BY date;
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map(|rows: Vec<(NaiveDate,)>| rows.into_iter().map(|(date,)| date).collect())
        .map_err(convert_error)
    }
}
