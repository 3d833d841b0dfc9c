//! Boundary for location feeds coming from driver devices.

pub mod traits;

pub use traits::{LocationEvent, LocationSource};
