//! R-tree nodes for spatial indexing of stop points.
//!
//! ## Two-Stage Filtering
//!
//! The spatial queries use a two-stage filtering approach:
//! 1. **R-tree filter**: Uses Euclidean distance in degrees for fast approximate filtering
//! 2. **Haversine filter**: Applies accurate geodesic distance on filtered results
//!
//! The R-tree radius is widened for the query latitude so the first stage
//! never drops a stop the second stage would keep.

use geo::Point;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::models::entities::StopPoint;
use crate::spatial::queries::{haversine_distance, search_radius_degrees};

// ============================================================================
// Stop Point Spatial Node
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct StopPointNode {
    pub stop: StopPoint,
    point: [f64; 2],
}

impl StopPointNode {
    pub fn new(stop: StopPoint) -> Self {
        let point = [stop.location.x(), stop.location.y()];
        Self { stop, point }
    }
}

impl RTreeObject for StopPointNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for StopPointNode {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

// ============================================================================
// Index
// ============================================================================

/// Stop points searchable by distance
#[derive(Clone, Debug, Default)]
pub struct StopPointIndex {
    tree: RTree<StopPointNode>,
}

impl StopPointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stops(stops: impl IntoIterator<Item = StopPoint>) -> Self {
        Self {
            tree: RTree::bulk_load(stops.into_iter().map(StopPointNode::new).collect()),
        }
    }

    pub fn insert(&mut self, stop: StopPoint) {
        self.tree.insert(StopPointNode::new(stop));
    }

    /// Drop the node stored for `stop`; returns whether one was found
    pub fn remove(&mut self, stop: &StopPoint) -> bool {
        self.tree.remove(&StopPointNode::new(stop.clone())).is_some()
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops within `radius_m` meters, nearest first
    pub fn within(&self, point: Point, radius_m: f64) -> Vec<(StopPoint, f64)> {
        if radius_m <= 0.0 || !radius_m.is_finite() {
            return Vec::new();
        }

        let radius_deg = search_radius_degrees(radius_m, point.y());

        let mut hits: Vec<(StopPoint, f64)> = self
            .tree
            .locate_within_distance([point.x(), point.y()], radius_deg * radius_deg)
            .map(|node| (node, haversine_distance(point, node.stop.location)))
            .filter(|(_, dist)| *dist <= radius_m)
            .map(|(node, dist)| (node.stop.clone(), dist))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits
    }

    pub fn nearest(&self, point: Point) -> Option<&StopPoint> {
        self.tree
            .nearest_neighbor(&[point.x(), point.y()])
            .map(|node| &node.stop)
    }
}
