pub mod aggregate;
pub mod cost;
pub mod delay;
pub mod reference;
pub mod vehicle;

pub use vehicle::VehicleId;
