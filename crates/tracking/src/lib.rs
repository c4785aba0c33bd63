pub mod actor;
pub mod classify;
pub mod registry;
pub mod tracker;

pub use actor::{Orphaned, PositionUpdate};
pub use registry::{TrackerRegistry, IDLE_TIMEOUT};
pub use tracker::{Tracker, TrackingError};
