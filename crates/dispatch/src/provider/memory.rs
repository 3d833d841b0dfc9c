//! In-memory dispatch repository.
//!
//! Keeps every row in hash maps behind one lock, so `apply` is trivially
//! atomic. Stop points are additionally kept in an R-tree for proximity
//! lookups. Useful for tests, simulations and single-process deployments.

use chrono::NaiveDate;
use geo::Point;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::engine::attendance::check_assignment_overlaps;
use crate::identifiers::*;
use crate::models::entities::*;
use crate::models::traits::DispatchRepository;
use crate::models::types::*;
use crate::spatial::index::StopPointIndex;

#[derive(Default)]
struct Store {
    // Network
    schedules: HashMap<ScheduleIdentifier, Schedule>,
    route_stops: HashMap<RouteIdentifier, Vec<RouteStopPoint>>,
    stop_points: HashMap<StopPointIdentifier, StopPoint>,
    stop_index: StopPointIndex,

    // Trips
    trips: HashMap<TripIdentifier, Trip>,
    trip_by_day: HashMap<(ScheduleIdentifier, NaiveDate), TripIdentifier>,
    trip_stops: HashMap<TripIdentifier, Vec<TripStop>>,

    // Students
    assignments: Vec<StudentAssignment>,
    attendance: HashMap<(TripIdentifier, StudentIdentifier), StudentAttendance>,

    tracking: HashMap<TripIdentifier, Vec<TrackingEntry>>,
}

impl Store {
    fn check_version(&self, trip_id: &TripIdentifier, expected: u64) -> Result<()> {
        let found = self
            .trips
            .get(trip_id)
            .map(|t| t.version)
            .ok_or_else(|| DispatchError::TripNotFound(trip_id.clone()))?;
        if found != expected {
            warn!(trip_id = %trip_id, expected, found, "rejected stale trip write");
            return Err(DispatchError::ConcurrentModification {
                trip_id: trip_id.clone(),
                expected,
                found,
            });
        }
        Ok(())
    }

    fn check_stop(&self, stop: &TripStop) -> Result<()> {
        let known = self
            .trip_stops
            .get(&stop.trip_id)
            .map_or(false, |stops| stops.iter().any(|s| s.id == stop.id));
        if !known {
            return Err(DispatchError::StopNotOnTrip {
                trip_id: stop.trip_id.clone(),
                stop_id: stop.stop_point_id.clone(),
            });
        }
        Ok(())
    }

    fn write_stop(&mut self, stop: &TripStop) {
        if let Some(slot) = self
            .trip_stops
            .get_mut(&stop.trip_id)
            .and_then(|stops| stops.iter_mut().find(|s| s.id == stop.id))
        {
            *slot = stop.clone();
        }
    }

    fn write_attendance(&mut self, record: &StudentAttendance) {
        self.attendance.insert(
            (record.trip_id.clone(), record.student_id.clone()),
            record.clone(),
        );
    }
}

/// Thread-safe in-memory implementation of `DispatchRepository`
#[derive(Default)]
pub struct InMemoryRepository {
    store: RwLock<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-applied change set,
    // because every write path validates before it mutates.
    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Loading ----

    pub fn add_schedule(&self, schedule: Schedule) {
        self.write().schedules.insert(schedule.id.clone(), schedule);
    }

    /// Insert or move a stop point
    pub fn add_stop_point(&self, stop: StopPoint) {
        let mut store = self.write();
        if let Some(previous) = store.stop_points.get(&stop.id).cloned() {
            store.stop_index.remove(&previous);
        }
        store.stop_index.insert(stop.clone());
        store.stop_points.insert(stop.id.clone(), stop);
    }

    pub fn add_route_stop(&self, route_stop: RouteStopPoint) {
        self.write()
            .route_stops
            .entry(route_stop.route_id.clone())
            .or_default()
            .push(route_stop);
    }

    /// Fails with `OverlappingAssignment` if the student already holds an
    /// overlapping assignment for the same direction.
    pub fn add_assignment(&self, assignment: StudentAssignment) -> Result<()> {
        let mut store = self.write();
        let mut candidate: Vec<StudentAssignment> = store
            .assignments
            .iter()
            .filter(|a| a.student_id == assignment.student_id)
            .cloned()
            .collect();
        candidate.push(assignment.clone());
        check_assignment_overlaps(&candidate)?;

        store.assignments.push(assignment);
        Ok(())
    }
}

impl DispatchRepository for InMemoryRepository {
    fn get_schedule(&self, id: &ScheduleIdentifier) -> Result<Schedule> {
        self.read()
            .schedules
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::ScheduleNotFound(id.clone()))
    }

    fn active_schedules(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .read()
            .schedules
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    fn route_stop_points(&self, route_id: &RouteIdentifier) -> Result<Vec<RouteStopPoint>> {
        Ok(self
            .read()
            .route_stops
            .get(route_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_stop_point(&self, id: &StopPointIdentifier) -> Option<StopPoint> {
        self.read().stop_points.get(id).cloned()
    }

    fn stop_points_near(&self, point: Point, radius_m: f64) -> Vec<StopPoint> {
        self.read()
            .stop_index
            .within(point, radius_m)
            .into_iter()
            .map(|(stop, _)| stop)
            .collect()
    }

    fn find_trip_by_schedule_and_date(
        &self,
        schedule_id: &ScheduleIdentifier,
        date: NaiveDate,
    ) -> Result<Option<Trip>> {
        let store = self.read();
        Ok(store
            .trip_by_day
            .get(&(schedule_id.clone(), date))
            .and_then(|id| store.trips.get(id))
            .cloned())
    }

    fn load_trip(&self, trip_id: &TripIdentifier) -> Result<TripSnapshot> {
        let store = self.read();
        let trip = store
            .trips
            .get(trip_id)
            .cloned()
            .ok_or_else(|| DispatchError::TripNotFound(trip_id.clone()))?;
        let stops = store.trip_stops.get(trip_id).cloned().unwrap_or_default();
        Ok(TripSnapshot::new(trip, stops))
    }

    fn trips_on(&self, date: NaiveDate) -> Result<Vec<Trip>> {
        let mut trips: Vec<Trip> = self
            .read()
            .trips
            .values()
            .filter(|t| t.date == date)
            .cloned()
            .collect();
        trips.sort_by(|a, b| a.planned_start.cmp(&b.planned_start).then_with(|| a.id.cmp(&b.id)));
        Ok(trips)
    }

    fn insert_trip(&self, snapshot: &TripSnapshot) -> Result<()> {
        let mut store = self.write();
        let key = (snapshot.trip.schedule_id.clone(), snapshot.trip.date);
        if store.trip_by_day.contains_key(&key) || store.trips.contains_key(&snapshot.trip.id) {
            return Err(DispatchError::DuplicateTrip {
                schedule_id: key.0,
                date: key.1,
            });
        }

        let trip_id = snapshot.trip.id.clone();
        store.trip_by_day.insert(key, trip_id.clone());
        store.trips.insert(trip_id.clone(), snapshot.trip.clone());
        store.trip_stops.insert(trip_id.clone(), snapshot.stops.clone());
        debug!(trip_id = %trip_id, stops = snapshot.stops.len(), "inserted trip");
        Ok(())
    }

    fn save_trip(&self, trip: &Trip, expected_version: u64) -> Result<()> {
        let mut store = self.write();
        store.check_version(&trip.id, expected_version)?;
        store.trips.insert(trip.id.clone(), trip.clone());
        Ok(())
    }

    fn save_trip_stop(&self, stop: &TripStop) -> Result<()> {
        let mut store = self.write();
        store.check_stop(stop)?;
        store.write_stop(stop);
        Ok(())
    }

    fn find_active_assignments_for_stop(
        &self,
        route_id: &RouteIdentifier,
        stop_id: &StopPointIdentifier,
        date: NaiveDate,
    ) -> Result<Vec<StudentAssignment>> {
        Ok(self
            .read()
            .assignments
            .iter()
            .filter(|a| {
                &a.route_id == route_id && &a.stop_point_id == stop_id && a.is_effective_on(date)
            })
            .cloned()
            .collect())
    }

    fn find_active_assignments_for_route(
        &self,
        route_id: &RouteIdentifier,
        date: NaiveDate,
    ) -> Result<Vec<StudentAssignment>> {
        Ok(self
            .read()
            .assignments
            .iter()
            .filter(|a| &a.route_id == route_id && a.is_effective_on(date))
            .cloned()
            .collect())
    }

    fn attendance_for_trip(&self, trip_id: &TripIdentifier) -> Result<Vec<StudentAttendance>> {
        let mut records: Vec<StudentAttendance> = self
            .read()
            .attendance
            .values()
            .filter(|r| &r.trip_id == trip_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        Ok(records)
    }

    fn upsert_attendance(&self, record: &StudentAttendance) -> Result<()> {
        let mut store = self.write();
        if !store.trips.contains_key(&record.trip_id) {
            return Err(DispatchError::TripNotFound(record.trip_id.clone()));
        }
        store.write_attendance(record);
        Ok(())
    }

    fn append_tracking(&self, entry: &TrackingEntry) -> Result<()> {
        let mut store = self.write();
        if !store.trips.contains_key(&entry.trip_id) {
            return Err(DispatchError::TripNotFound(entry.trip_id.clone()));
        }
        store
            .tracking
            .entry(entry.trip_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn tracking_for_trip(&self, trip_id: &TripIdentifier) -> Result<Vec<TrackingEntry>> {
        Ok(self.read().tracking.get(trip_id).cloned().unwrap_or_default())
    }

    fn apply(&self, changes: &TripChangeSet) -> Result<()> {
        let mut store = self.write();
        store.check_version(&changes.trip.id, changes.expected_version)?;
        if changes.is_noop() {
            return Ok(());
        }
        for stop in &changes.stops {
            store.check_stop(stop)?;
        }

        store.trips.insert(changes.trip.id.clone(), changes.trip.clone());
        for stop in &changes.stops {
            store.write_stop(stop);
        }
        for record in &changes.attendance {
            store.write_attendance(record);
        }
        if !changes.tracking.is_empty() {
            store
                .tracking
                .entry(changes.trip.id.clone())
                .or_default()
                .extend(changes.tracking.iter().cloned());
        }
        debug!(
            trip_id = %changes.trip.id,
            version = changes.trip.version,
            stops = changes.stops.len(),
            attendance = changes.attendance.len(),
            "applied change set"
        );
        Ok(())
    }
}
