//! Spatial indexing, distance and track encoding utilities.

pub mod index;
pub mod polyline;
pub mod queries;

pub use index::StopPointIndex;
pub use queries::haversine_distance;
