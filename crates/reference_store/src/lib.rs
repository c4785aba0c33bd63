//! The reference store: read-only spatial lookups against the static
//! stop/intersection/line-terminal data seeded from the transit agency's
//! schedule feed. Seeding itself is out of scope; this crate only answers
//! queries against whatever is already in the table.

use async_trait::async_trait;
use model::reference::{
    NEAR_INTERSECTION_RADIUS_M, NEAR_STOP_RADIUS_M, TERMINAL_RADIUS_M,
};

pub mod fake;
pub mod postgres;

#[derive(Debug)]
pub enum ReferenceError {
    Backend(Box<dyn std::error::Error + Send + Sync>),
    Timeout,
}

impl std::fmt::Display for ReferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceError::Backend(why) => write!(f, "reference store error: {why}"),
            ReferenceError::Timeout => write!(f, "reference store lookup timed out"),
        }
    }
}

impl std::error::Error for ReferenceError {}

pub type Result<T> = std::result::Result<T, ReferenceError>;

/// Read-only spatial lookups against the reference data.
///
/// Boolean lookups surface backend errors to the caller — the vehicle
/// tracker is required to skip classification for the cycle rather than
/// silently treat a failed lookup as "no match", which would otherwise bias
/// detection towards false positives. Name lookups fail open to `None`
/// instead, since they only feed display strings.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn near_stop(&self, lat: f64, lon: f64) -> Result<bool> {
        self.near_stop_within(lat, lon, NEAR_STOP_RADIUS_M).await
    }

    async fn near_stop_within(&self, lat: f64, lon: f64, radius_m: f64) -> Result<bool>;

    async fn near_intersection(&self, lat: f64, lon: f64) -> Result<bool> {
        self.near_intersection_within(lat, lon, NEAR_INTERSECTION_RADIUS_M)
            .await
    }

    async fn near_intersection_within(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<bool>;

    /// True iff a stop within the terminal approach radius is a terminal
    /// *for this specific line*. A stop may be a terminal for one line
    /// while being a regular stop for another.
    async fn line_has_terminal_at(&self, line: Option<&str>, lat: f64, lon: f64) -> Result<bool> {
        match line {
            Some(line) => {
                self.line_has_terminal_at_within(line, lat, lon, TERMINAL_RADIUS_M)
                    .await
            }
            None => Ok(false),
        }
    }

    async fn line_has_terminal_at_within(
        &self,
        line: &str,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<bool>;

    /// Best-effort only: returns `None` on any backend error instead of
    /// propagating it.
    async fn nearest_stop_name(&self, lat: f64, lon: f64) -> Option<String>;

    /// Best-effort only: returns `None` on any backend error instead of
    /// propagating it.
    async fn nearest_intersection_name(&self, lat: f64, lon: f64) -> Option<String>;
}
