//! Postgres-backed `ReferenceStore`, grounded on the bounding-box + great
//! circle query shape used by the schedule database for spatial stop lookups.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use util::geo::{calculate_bounding_box, EARTH_RADIUS_KM};

use crate::{ReferenceError, ReferenceStore, Result};

/// Upper bound on a single lookup: the tracker must never stall waiting on
/// the reference store for longer than this.
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

pub struct PgReferenceStore {
    pool: PgPool,
}

impl PgReferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn convert_error(why: sqlx::Error) -> ReferenceError {
    ReferenceError::Backend(Box::new(why))
}

async fn bounded<T>(query: impl std::future::Future<Output = sqlx::Result<T>>) -> Result<T> {
    tokio::time::timeout(LOOKUP_TIMEOUT, query)
        .await
        .map_err(|_| ReferenceError::Timeout)?
        .map_err(convert_error)
}

#[async_trait]
impl ReferenceStore for PgReferenceStore {
    async fn near_stop_within(&self, lat: f64, lon: f64, radius_m: f64) -> Result<bool> {
        let radius_km = radius_m / 1000.0;
        let ((min_lat, min_lon), (max_lat, max_lon)) =
            calculate_bounding_box(lat, lon, radius_km);

        let row = bounded(
            sqlx::query(
                "
                SELECT EXISTS (
                    SELECT 1 FROM stops
                    WHERE latitude BETWEEN $4 AND $5
                      AND longitude BETWEEN $6 AND $7
                      AND ($1 * ACOS(
                            COS(RADIANS($2)) * COS(RADIANS(latitude)) *
                            COS(RADIANS(longitude) - RADIANS($3)) +
                            SIN(RADIANS($2)) * SIN(RADIANS(latitude))
                          )) < $8
                ) AS found;
                ",
            )
            .bind(EARTH_RADIUS_KM)
            .bind(lat)
            .bind(lon)
            .bind(min_lat)
            .bind(max_lat)
            .bind(min_lon)
            .bind(max_lon)
            .bind(radius_km)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(row.get("found"))
    }

    async fn near_intersection_within(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<bool> {
        let radius_km = radius_m / 1000.0;
        let ((min_lat, min_lon), (max_lat, max_lon)) =
            calculate_bounding_box(lat, lon, radius_km);

        let row = bounded(
            sqlx::query(
                "
                SELECT EXISTS (
                    SELECT 1 FROM intersections
                    WHERE latitude BETWEEN $4 AND $5
                      AND longitude BETWEEN $6 AND $7
                      AND ($1 * ACOS(
                            COS(RADIANS($2)) * COS(RADIANS(latitude)) *
                            COS(RADIANS(longitude) - RADIANS($3)) +
                            SIN(RADIANS($2)) * SIN(RADIANS(latitude))
                          )) < $8
                ) AS found;
                ",
            )
            .bind(EARTH_RADIUS_KM)
            .bind(lat)
            .bind(lon)
            .bind(min_lat)
            .bind(max_lat)
            .bind(min_lon)
            .bind(max_lon)
            .bind(radius_km)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(row.get("found"))
    }

    async fn line_has_terminal_at_within(
        &self,
        line: &str,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<bool> {
        let radius_km = radius_m / 1000.0;
        let ((min_lat, min_lon), (max_lat, max_lon)) =
            calculate_bounding_box(lat, lon, radius_km);

        let row = bounded(
            sqlx::query(
                "
                SELECT EXISTS (
                    SELECT 1 FROM stops s
                    JOIN line_terminals t ON t.stop_id = s.id
                    WHERE t.line = $9
                      AND s.latitude BETWEEN $4 AND $5
                      AND s.longitude BETWEEN $6 AND $7
                      AND ($1 * ACOS(
                            COS(RADIANS($2)) * COS(RADIANS(s.latitude)) *
                            COS(RADIANS(s.longitude) - RADIANS($3)) +
                            SIN(RADIANS($2)) * SIN(RADIANS(s.latitude))
                          )) < $8
                ) AS found;
                ",
            )
            .bind(EARTH_RADIUS_KM)
            .bind(lat)
            .bind(lon)
            .bind(min_lat)
            .bind(max_lat)
            .bind(min_lon)
            .bind(max_lon)
            .bind(radius_km)
            .bind(line)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(row.get("found"))
    }

    async fn nearest_stop_name(&self, lat: f64, lon: f64) -> Option<String> {
        let query = sqlx::query(
            "
            SELECT name, ($1 * ACOS(
                COS(RADIANS($2)) * COS(RADIANS(latitude)) *
                COS(RADIANS(longitude) - RADIANS($3)) +
                SIN(RADIANS($2)) * SIN(RADIANS(latitude))
            )) AS distance
            FROM stops
            ORDER BY distance ASC
            LIMIT 1;
            ",
        )
        .bind(EARTH_RADIUS_KM)
        .bind(lat)
        .bind(lon)
        .fetch_optional(&self.pool);

        tokio::time::timeout(LOOKUP_TIMEOUT, query)
            .await
            .ok()?
            .ok()
            .flatten()
            .map(|row| row.get("name"))
    }

    async fn nearest_intersection_name(&self, lat: f64, lon: f64) -> Option<String> {
        let query = sqlx::query(
            "
            SELECT name, ($1 * ACOS(
                COS(RADIANS($2)) * COS(RADIANS(latitude)) *
                COS(RADIANS(longitude) - RADIANS($3)) +
                SIN(RADIANS($2)) * SIN(RADIANS(latitude))
            )) AS distance
            FROM intersections
            ORDER BY distance ASC
            LIMIT 1;
            ",
        )
        .bind(EARTH_RADIUS_KM)
        .bind(lat)
        .bind(lon)
        .fetch_optional(&self.pool);

        tokio::time::timeout(LOOKUP_TIMEOUT, query)
            .await
            .ok()?
            .ok()
            .flatten()
            .map(|row| row.get("name"))
    }
}
