//! Persistence boundary of the engine.
//!
//! The engine never talks to storage itself; the service reads and writes
//! through this trait. Implementations can be in-memory, database-backed,
//! or remote.

use chrono::NaiveDate;
use geo::Point;

use crate::identifiers::*;
use crate::models::entities::*;
use crate::models::types::Result;

/// Storage of schedules, trips and attendance
pub trait DispatchRepository: Send + Sync {
    // ---- Network ----
    fn get_schedule(&self, id: &ScheduleIdentifier) -> Result<Schedule>;
    fn active_schedules(&self) -> Result<Vec<Schedule>>;

    /// Every stop point of the route, active or not, in any order
    fn route_stop_points(&self, route_id: &RouteIdentifier) -> Result<Vec<RouteStopPoint>>;

    fn get_stop_point(&self, id: &StopPointIdentifier) -> Option<StopPoint>;

    /// Stop points within `radius_m` meters of `point`, nearest first
    fn stop_points_near(&self, point: Point, radius_m: f64) -> Vec<StopPoint>;

    // ---- Trips ----
    fn find_trip_by_schedule_and_date(
        &self,
        schedule_id: &ScheduleIdentifier,
        date: NaiveDate,
    ) -> Result<Option<Trip>>;

    fn load_trip(&self, trip_id: &TripIdentifier) -> Result<TripSnapshot>;

    fn trips_on(&self, date: NaiveDate) -> Result<Vec<Trip>>;

    /// Store a freshly materialized trip with its stops.
    ///
    /// Fails with `DuplicateTrip` when the schedule already has a trip that day.
    fn insert_trip(&self, snapshot: &TripSnapshot) -> Result<()>;

    /// Overwrite the trip row if it is still at `expected_version`
    fn save_trip(&self, trip: &Trip, expected_version: u64) -> Result<()>;

    fn save_trip_stop(&self, stop: &TripStop) -> Result<()>;

    // ---- Students ----
    fn find_active_assignments_for_stop(
        &self,
        route_id: &RouteIdentifier,
        stop_id: &StopPointIdentifier,
        date: NaiveDate,
    ) -> Result<Vec<StudentAssignment>>;

    fn find_active_assignments_for_route(
        &self,
        route_id: &RouteIdentifier,
        date: NaiveDate,
    ) -> Result<Vec<StudentAssignment>>;

    fn attendance_for_trip(&self, trip_id: &TripIdentifier) -> Result<Vec<StudentAttendance>>;

    fn upsert_attendance(&self, record: &StudentAttendance) -> Result<()>;

    // ---- Tracking ----
    fn append_tracking(&self, entry: &TrackingEntry) -> Result<()>;

    fn tracking_for_trip(&self, trip_id: &TripIdentifier) -> Result<Vec<TrackingEntry>>;

    // ---- Atomic writes ----

    /// Persist a whole change set or nothing.
    ///
    /// Must fail with `ConcurrentModification` (writing nothing) when the
    /// stored trip is no longer at `changes.expected_version`.
    fn apply(&self, changes: &TripChangeSet) -> Result<()>;
}
