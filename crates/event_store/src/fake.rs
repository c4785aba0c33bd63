//! In-memory `EventStore` for the tracker's unit tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::delay::{is_multi_cycle, DelayEvent, NewDelayEvent};
use tokio::sync::RwLock;
use util::id::Id;

use crate::{EventStore, EventStoreError, Result};

#[derive(Default)]
pub struct FakeEventStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    events: BTreeMap<i64, DelayEvent>,
    next_id: i64,
}

impl FakeEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<DelayEvent> {
        self.inner.read().await.events.values().cloned().collect()
    }
}

#[async_trait]
impl EventStore for FakeEventStore {
    async fn create(&self, event: NewDelayEvent) -> Result<Id<DelayEvent>> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.events.insert(
            id,
            DelayEvent {
                vehicle_id: event.vehicle_id,
                line: event.line,
                trip_id: event.trip_id,
                lat: event.lat,
                lon: event.lon,
                started_at: event.started_at,
                resolved_at: None,
                duration_seconds: None,
                classification: event.classification,
                at_stop: event.at_stop,
                near_intersection: event.near_intersection,
                multi_cycle: false,
            },
        );
        Ok(Id::new(id))
    }

    async fn get(&self, id: Id<DelayEvent>) -> Result<DelayEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .get(&id.raw())
            .cloned()
            .ok_or(EventStoreError::NotFound)
    }

    async fn resolve(&self, id: Id<DelayEvent>, resolved_at: DateTime<Utc>) -> Result<DelayEvent> {
        let mut inner = self.inner.write().await;
        let event = inner
            .events
            .get_mut(&id.raw())
            .ok_or(EventStoreError::NotFound)?;
        if event.resolved_at.is_some() {
            return Err(EventStoreError::Backend("already resolved".into()));
        }
        let duration_seconds = (resolved_at - event.started_at).num_seconds();
        event.resolved_at = Some(resolved_at);
        event.duration_seconds = Some(duration_seconds);
        event.multi_cycle = is_multi_cycle(duration_seconds, event.near_intersection);
        Ok(event.clone())
    }

    async fn find_unresolved_by_vehicle(&self, vehicle_id: &str) -> Result<Option<DelayEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .find(|e| e.vehicle_id == vehicle_id && e.resolved_at.is_none())
            .cloned())
    }

    async fn delete_orphans_unresolved(&self, vehicle_id: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner
            .events
            .retain(|_, e| !(e.vehicle_id == vehicle_id && e.resolved_at.is_none()));
        Ok((before - inner.events.len()) as u64)
    }

    async fn list_unresolved_vehicle_ids(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .events
            .values()
            .filter(|e| e.resolved_at.is_none())
            .map(|e| e.vehicle_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn scan(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DelayEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .filter(|e| e.resolved_at.is_some() && e.started_at >= from && e.started_at < to)
            .cloned()
            .collect())
    }

    async fn delete_for_date(&self, date: chrono::NaiveDate) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner.events.retain(|_, e| e.started_at.date_naive() != date);
        Ok((before - inner.events.len()) as u64)
    }

    async fn dates_with_events_before(&self, cutoff: chrono::NaiveDate) -> Result<Vec<chrono::NaiveDate>> {
        let inner = self.inner.read().await;
        let mut dates: Vec<chrono::NaiveDate> = inner
            .events
            .values()
            .map(|e| e.started_at.date_naive())
            .filter(|date| *date < cutoff)
            .collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use model::delay::PersistedClassification;

    fn sample(vehicle_id: &str, started_at: DateTime<Utc>) -> NewDelayEvent {
        NewDelayEvent {
            vehicle_id: vehicle_id.to_owned(),
            line: Some("17".to_owned()),
            trip_id: None,
            lat: 52.23,
            lon: 21.01,
            started_at,
            classification: PersistedClassification::Delay,
            at_stop: false,
            near_intersection: true,
        }
    }

    #[tokio::test]
    async fn create_then_resolve_computes_duration_and_multi_cycle() {
        let store = FakeEventStore::new();
        let started = Utc::now();
        let id = store.create(sample("V1", started)).await.unwrap();

        let resolved = store.resolve(id, started + Duration::seconds(150)).await.unwrap();
        assert_eq!(resolved.duration_seconds, Some(150));
        assert!(resolved.multi_cycle);
    }

    #[tokio::test]
    async fn resolving_twice_is_an_error() {
        let store = FakeEventStore::new();
        let started = Utc::now();
        let id = store.create(sample("V1", started)).await.unwrap();
        store.resolve(id, started + Duration::seconds(60)).await.unwrap();
        assert!(store.resolve(id, started + Duration::seconds(90)).await.is_err());
    }

    #[tokio::test]
    async fn orphan_deletion_only_removes_unresolved_events() {
        let store = FakeEventStore::new();
        let started = Utc::now();
        let open = store.create(sample("V1", started)).await.unwrap();
        let closed = store.create(sample("V1", started)).await.unwrap();
        store.resolve(closed, started + Duration::seconds(40)).await.unwrap();

        let deleted = store.delete_orphans_unresolved("V1").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(open).await.is_err());
        assert!(store.get(closed).await.is_ok());
    }

    #[tokio::test]
    async fn scan_only_returns_resolved_events_in_range() {
        let store = FakeEventStore::new();
        let started = Utc::now();
        let resolved_id = store.create(sample("V1", started)).await.unwrap();
        store.resolve(resolved_id, started + Duration::seconds(40)).await.unwrap();
        store.create(sample("V2", started)).await.unwrap();

        let results = store
            .scan(started - Duration::hours(1), started + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vehicle_id, "V1");
    }

    #[tokio::test]
    async fn list_unresolved_vehicle_ids_excludes_resolved_and_dedupes() {
        let store = FakeEventStore::new();
        let started = Utc::now();
        store.create(sample("V1", started)).await.unwrap();
        store.create(sample("V1", started)).await.unwrap();
        let resolved = store.create(sample("V2", started)).await.unwrap();
        store.resolve(resolved, started + Duration::seconds(40)).await.unwrap();

        let ids = store.list_unresolved_vehicle_ids().await.unwrap();
        assert_eq!(ids, vec!["V1".to_owned()]);
    }
}
