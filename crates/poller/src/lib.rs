//! The poller: pulls the vehicle feed on a fixed interval, keeps only tram
//! lines, and hands each vehicle's latest position to the tracker registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use model::vehicle::PositionSample;
use model::VehicleId;
use tokio::sync::Mutex;
use tracking::{PositionUpdate, TrackerRegistry};

/// Tram lines run 1-79 in the source agency's numbering scheme; bus and
/// other-mode vehicles sharing the same feed are filtered out here rather
/// than pushed through the tracker only to be ignored downstream.
pub const TRAM_LINE_RANGE: std::ops::RangeInclusive<u32> = 1..=79;

pub fn is_tram_line(line: &str) -> bool {
    line.parse::<u32>()
        .map(|value| TRAM_LINE_RANGE.contains(&value))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct VehiclePosition {
    pub vehicle_id: VehicleId,
    pub line: Option<String>,
    pub trip_id: Option<String>,
    pub sample: PositionSample,
}

#[derive(Debug)]
pub enum PollError {
    Fetch(Box<dyn std::error::Error + Send + Sync>),
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Fetch(why) => write!(f, "failed to fetch feed: {why}"),
            PollError::Decode(why) => write!(f, "failed to decode feed: {why}"),
        }
    }
}

impl std::error::Error for PollError {}

/// Retrieves the raw feed bytes, decoupled from how they are parsed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, PollError>;
}

/// Turns raw feed bytes into vehicle positions. Kept separate from
/// `FeedSource` so the wire format (GTFS-Realtime protobuf, or any other
/// transit agency's variant) can be swapped without touching the HTTP layer.
pub trait FeedDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Vec<VehiclePosition>, PollError>;
}

pub struct HttpFeedSource {
    client: reqwest::Client,
    url: String,
}

impl HttpFeedSource {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is static and always valid");
        Self { client, url }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self) -> Result<Vec<u8>, PollError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|why| PollError::Fetch(Box::new(why)))?
            .error_for_status()
            .map_err(|why| PollError::Fetch(Box::new(why)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|why| PollError::Fetch(Box::new(why)))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub total_polls: u64,
    pub total_positions_applied: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Vehicles of any mode present in the most recent feed snapshot.
    pub last_vehicle_count: u64,
    /// Tram vehicles (after the line-range filter) in the most recent feed
    /// snapshot.
    pub last_tram_count: u64,
    pub last_error: Option<String>,
    /// Cumulative count of failed poll cycles.
    pub errors: u64,
}

pub struct Poller {
    source: Arc<dyn FeedSource>,
    decoder: Arc<dyn FeedDecoder>,
    registry: Arc<TrackerRegistry>,
    stats: Mutex<PollStats>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn FeedSource>,
        decoder: Arc<dyn FeedDecoder>,
        registry: Arc<TrackerRegistry>,
    ) -> Self {
        Self {
            source,
            decoder,
            registry,
            stats: Mutex::new(PollStats::default()),
        }
    }

    pub async fn stats(&self) -> PollStats {
        self.stats.lock().await.clone()
    }

    /// One fetch-decode-filter-dispatch cycle. Returns the number of
    /// positions actually dispatched to the registry.
    pub async fn poll_once(&self) -> Result<usize, PollError> {
        let raw = self.source.fetch().await?;
        let positions = self.decoder.decode(&raw)?;
        let coalesced = coalesce_by_vehicle(positions);
        let vehicle_count = coalesced.len() as u64;

        let mut dispatched = 0;
        for position in coalesced {
            let line_is_tram = position
                .line
                .as_deref()
                .map(is_tram_line)
                .unwrap_or(false);
            if !line_is_tram {
                continue;
            }
            self.registry
                .dispatch(
                    position.vehicle_id,
                    PositionUpdate {
                        sample: position.sample,
                        line: position.line,
                        trip_id: position.trip_id,
                    },
                )
                .await;
            dispatched += 1;
        }

        self.registry.reap_idle().await;

        let mut stats = self.stats.lock().await;
        stats.total_polls += 1;
        stats.total_positions_applied += dispatched as u64;
        stats.last_poll_at = Some(Utc::now());
        stats.last_vehicle_count = vehicle_count;
        stats.last_tram_count = dispatched as u64;
        stats.last_error = None;

        Ok(dispatched)
    }

    async fn record_error(&self, why: &PollError) {
        let mut stats = self.stats.lock().await;
        stats.total_polls += 1;
        stats.errors += 1;
        stats.last_error = Some(why.to_string());
    }
}

/// Keeps only the most recently-timestamped sample per vehicle within a
/// single feed snapshot: a malformed or duplicated feed entity should never
/// apply two positions for the same vehicle in one poll.
fn coalesce_by_vehicle(positions: Vec<VehiclePosition>) -> Vec<VehiclePosition> {
    let mut by_vehicle: HashMap<VehicleId, VehiclePosition> = HashMap::new();
    for position in positions {
        by_vehicle
            .entry(position.vehicle_id.clone())
            .and_modify(|existing| {
                if position.sample.feed_ts > existing.sample.feed_ts {
                    *existing = position.clone();
                }
            })
            .or_insert(position);
    }
    by_vehicle.into_values().collect()
}

/// Runs `poll_once` on a fixed interval for as long as the returned handle
/// is kept alive, catching panics and backing off on repeated failures
/// rather than tearing down the whole process.
pub fn run_supervised(poller: Arc<Poller>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = interval;
        loop {
            tokio::time::sleep(interval).await;

            let result = AssertUnwindSafe(poller.poll_once()).catch_unwind().await;
            match result {
                Ok(Ok(dispatched)) => {
                    log::debug!("poll cycle dispatched {dispatched} positions");
                    backoff = interval;
                }
                Ok(Err(why)) => {
                    log::error!("poll cycle failed: {why}");
                    poller.record_error(&why).await;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(300));
                }
                Err(why) => {
                    log::error!("poll cycle panicked: {why:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(300));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tram_line_range_excludes_bus_lines() {
        assert!(is_tram_line("17"));
        assert!(is_tram_line("1"));
        assert!(is_tram_line("79"));
        assert!(!is_tram_line("80"));
        assert!(!is_tram_line("0"));
        assert!(!is_tram_line("N12"));
    }

    fn base_ts() -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2025, 1, 7, 12, 0, 0).unwrap()
    }

    fn sample_position(vehicle_id: &str, offset_secs: i64) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: vehicle_id.to_owned(),
            line: Some("17".to_owned()),
            trip_id: None,
            sample: PositionSample {
                lat: 52.23,
                lon: 21.01,
                feed_ts: base_ts() + chrono::Duration::seconds(offset_secs),
                received_at: base_ts(),
            },
        }
    }

    #[test]
    fn coalescing_keeps_the_latest_sample_per_vehicle() {
        let positions = vec![
            sample_position("V1", 0),
            sample_position("V1", 30),
            sample_position("V2", 0),
        ];
        let coalesced = coalesce_by_vehicle(positions);
        assert_eq!(coalesced.len(), 2);
        let v1 = coalesced.iter().find(|p| p.vehicle_id == "V1").unwrap();
        assert_eq!(v1.sample.feed_ts, base_ts() + chrono::Duration::seconds(30));
    }

    struct StaticSource;

    #[async_trait]
    impl FeedSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<u8>, PollError> {
            Ok(Vec::new())
        }
    }

    struct StaticDecoder(Vec<VehiclePosition>);

    impl FeedDecoder for StaticDecoder {
        fn decode(&self, _raw: &[u8]) -> Result<Vec<VehiclePosition>, PollError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn poll_once_records_vehicle_and_tram_counts() {
        use broker::DelayBroker;
        use event_store::fake::FakeEventStore;
        use reference_store::fake::FakeReferenceStore;
        use tracking::TrackerRegistry;

        let registry = Arc::new(TrackerRegistry::new(
            Arc::new(FakeReferenceStore::new()),
            Arc::new(FakeEventStore::new()),
            DelayBroker::new(16),
        ));
        let positions = vec![
            sample_position("V1", 0),
            {
                let mut bus = sample_position("V2", 0);
                bus.line = Some("512".to_owned());
                bus
            },
        ];
        let poller = Poller::new(
            Arc::new(StaticSource),
            Arc::new(StaticDecoder(positions)),
            registry,
        );

        poller.poll_once().await.unwrap();
        let stats = poller.stats().await;
        assert_eq!(stats.last_vehicle_count, 2);
        assert_eq!(stats.last_tram_count, 1);
        assert_eq!(stats.errors, 0);
    }
}
