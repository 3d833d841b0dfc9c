//! Pluggable location sources.
//!
//! Transport crates (HTTP handlers, message queues, device gateways) implement
//! `LocationSource` and hand it to `DispatchService::pump`.

use chrono::NaiveDateTime;
use geo::Point;
use std::future::Future;
use std::pin::Pin;

use crate::identifiers::TripIdentifier;
use crate::models::types::Result;

/// A normalized position report for one trip
#[derive(Clone, Debug, PartialEq)]
pub struct LocationEvent {
    pub trip_id: TripIdentifier,
    pub timestamp: NaiveDateTime,
    pub location: Point,
}

/// Delivers location events in batches
pub trait LocationSource: Send + Sync {
    /// Next batch of events. An empty batch means the source is drained.
    fn next_batch<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LocationEvent>>> + Send + 'a>>;
}
