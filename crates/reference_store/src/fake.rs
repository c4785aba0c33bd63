//! An in-memory `ReferenceStore` used by the tracker's unit tests — a linear
//! scan over a handful of stops/intersections is plenty for test fixtures
//! and keeps the state machine tests Postgres-free.

use async_trait::async_trait;
use model::reference::{Intersection, LineTerminal, Stop};
use tokio::sync::RwLock;
use util::geo::haversine_distance;

use crate::{ReferenceError, ReferenceStore, Result};

#[derive(Default)]
pub struct FakeReferenceStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    stops: Vec<Stop>,
    intersections: Vec<Intersection>,
    terminals: Vec<LineTerminal>,
    fail_boolean_lookups: bool,
}

impl FakeReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_stop(&self, stop: Stop) {
        self.inner.write().await.stops.push(stop);
    }

    pub async fn add_intersection(&self, intersection: Intersection) {
        self.inner.write().await.intersections.push(intersection);
    }

    pub async fn add_terminal(&self, terminal: LineTerminal) {
        self.inner.write().await.terminals.push(terminal);
    }

    /// Makes every boolean lookup return `ReferenceError::Backend` until
    /// reset, used to exercise the tracker's lookup-failure handling.
    pub async fn set_failing(&self, failing: bool) {
        self.inner.write().await.fail_boolean_lookups = failing;
    }
}

fn meters(distance_km: f64) -> f64 {
    distance_km * 1000.0
}

#[async_trait]
impl ReferenceStore for FakeReferenceStore {
    async fn near_stop_within(&self, lat: f64, lon: f64, radius_m: f64) -> Result<bool> {
        let inner = self.inner.read().await;
        if inner.fail_boolean_lookups {
            return Err(ReferenceError::Backend("simulated failure".into()));
        }
        Ok(inner.stops.iter().any(|stop| {
            meters(haversine_distance(lat, lon, stop.point.lat, stop.point.lon)) <= radius_m
        }))
    }

    async fn near_intersection_within(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<bool> {
        let inner = self.inner.read().await;
        if inner.fail_boolean_lookups {
            return Err(ReferenceError::Backend("simulated failure".into()));
        }
        Ok(inner.intersections.iter().any(|intersection| {
            meters(haversine_distance(
                lat,
                lon,
                intersection.point.lat,
                intersection.point.lon,
            )) <= radius_m
        }))
    }

    async fn line_has_terminal_at_within(
        &self,
        line: &str,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<bool> {
        let inner = self.inner.read().await;
        if inner.fail_boolean_lookups {
            return Err(ReferenceError::Backend("simulated failure".into()));
        }
        Ok(inner.stops.iter().any(|stop| {
            meters(haversine_distance(lat, lon, stop.point.lat, stop.point.lon)) <= radius_m
                && inner
                    .terminals
                    .iter()
                    .any(|t| t.line == line && t.stop_id == stop.id)
        }))
    }

    async fn nearest_stop_name(&self, lat: f64, lon: f64) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .stops
            .iter()
            .map(|stop| {
                (
                    haversine_distance(lat, lon, stop.point.lat, stop.point.lon),
                    stop,
                )
            })
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap())
            .map(|(_, stop)| stop.name.clone())
    }

    async fn nearest_intersection_name(&self, lat: f64, lon: f64) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .intersections
            .iter()
            .map(|intersection| {
                (
                    haversine_distance(lat, lon, intersection.point.lat, intersection.point.lon),
                    intersection,
                )
            })
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap())
            .and_then(|(_, intersection)| intersection.name.clone())
    }
}
