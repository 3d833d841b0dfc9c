//! Plain records exchanged between the engine and its repository.
//!
//! Relations are held as identifiers and resolved through the repository,
//! never as live references, so no record points back at its owner.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use geo::Point;
use std::sync::Arc;

use crate::identifiers::*;
use crate::models::calendar::{DateRange, WeekdayFlags};
use crate::models::types::*;

// ============================================================================
// Network
// ============================================================================

/// A physical place where the bus stops
#[derive(Clone, Debug, PartialEq)]
pub struct StopPoint {
    pub id: StopPointIdentifier,
    pub name: Arc<str>,
    pub location: Point,
}

/// Position of a stop point within a route
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteStopPoint {
    pub route_id: RouteIdentifier,
    pub stop_point_id: StopPointIdentifier,
    pub sequence: u32,
    pub direction: Direction,
    /// Inactive entries stay in the route but are not visited by new trips
    pub active: bool,
}

/// Recurring commitment of one bus, one driver and one route
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    pub id: ScheduleIdentifier,
    pub bus_id: BusIdentifier,
    pub driver_id: DriverIdentifier,
    pub route_id: RouteIdentifier,
    pub schedule_type: ScheduleType,
    pub days_of_week: WeekdayFlags,
    pub start_time: NaiveTime,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: ScheduleStatus,
}

impl Schedule {
    /// Validity window; `None` when the stored dates are inverted
    pub fn validity(&self) -> Option<DateRange> {
        DateRange::new(self.start_date, self.end_date).ok()
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }
}

// ============================================================================
// Trips
// ============================================================================

/// One concrete run of a schedule on one date
#[derive(Clone, Debug, PartialEq)]
pub struct Trip {
    pub id: TripIdentifier,
    pub schedule_id: ScheduleIdentifier,
    pub route_id: RouteIdentifier,
    pub bus_id: BusIdentifier,
    pub driver_id: DriverIdentifier,
    pub date: NaiveDate,
    pub trip_type: TripType,
    pub status: TripStatus,
    pub planned_start: NaiveDateTime,
    pub actual_start_time: Option<NaiveDateTime>,
    pub actual_end_time: Option<NaiveDateTime>,
    pub current_stop_id: Option<StopPointIdentifier>,
    pub location: Option<Point>,
    pub cancel_reason: Option<Arc<str>>,
    /// Bumped on every accepted transition, used for optimistic locking
    pub version: u64,
}

/// One ordered visit of a trip to a stop point
#[derive(Clone, Debug, PartialEq)]
pub struct TripStop {
    pub id: TripStopIdentifier,
    pub trip_id: TripIdentifier,
    pub stop_point_id: StopPointIdentifier,
    pub sequence: u32,
    pub direction: Direction,
    pub status: TripStopStatus,
    pub actual_arrival: Option<NaiveDateTime>,
    pub actual_departure: Option<NaiveDateTime>,
    pub skip_reason: Option<Arc<str>>,
}

/// A trip together with its visits, ordered by `sequence`
#[derive(Clone, Debug, PartialEq)]
pub struct TripSnapshot {
    pub trip: Trip,
    pub stops: Vec<TripStop>,
}

impl TripSnapshot {
    pub fn new(trip: Trip, mut stops: Vec<TripStop>) -> Self {
        stops.sort_by_key(|s| s.sequence);
        Self { trip, stops }
    }

    pub fn id(&self) -> &TripIdentifier {
        &self.trip.id
    }

    /// The earliest visit still waiting for the bus
    pub fn next_pending(&self) -> Option<&TripStop> {
        self.stops
            .iter()
            .find(|s| s.status == TripStopStatus::Pending)
    }

    /// Visits that are neither done nor skipped
    pub fn unfinished(&self) -> impl Iterator<Item = &TripStop> {
        self.stops.iter().filter(|s| !s.status.is_terminal())
    }

    /// Visits of one stop point, in sequence (a looping route has several)
    pub fn visits_of(&self, stop_id: &StopPointIdentifier) -> impl Iterator<Item = &TripStop> + '_ {
        let stop_id = stop_id.clone();
        self.stops.iter().filter(move |s| s.stop_point_id == stop_id)
    }
}

// ============================================================================
// Students
// ============================================================================

/// Binds a student to a stop of a route for `[effective_from, effective_to)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StudentAssignment {
    pub id: AssignmentIdentifier,
    pub student_id: StudentIdentifier,
    pub route_id: RouteIdentifier,
    pub stop_point_id: StopPointIdentifier,
    pub direction: Direction,
    pub effective_from: NaiveDate,
    /// Exclusive; `None` is open-ended
    pub effective_to: Option<NaiveDate>,
}

impl StudentAssignment {
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        date >= self.effective_from && self.effective_to.map_or(true, |to| date < to)
    }

    pub fn overlaps(&self, other: &StudentAssignment) -> bool {
        let self_before_other_ends = other.effective_to.map_or(true, |to| self.effective_from < to);
        let other_before_self_ends = self.effective_to.map_or(true, |to| other.effective_from < to);
        self_before_other_ends && other_before_self_ends
    }
}

/// Something odd the reconciler accepted but wants a human to look at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttendanceAnomaly {
    DropoffWithoutPickup,
}

/// Whether and when a student rode a given trip
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StudentAttendance {
    pub trip_id: TripIdentifier,
    pub student_id: StudentIdentifier,
    pub status: AttendanceStatus,
    pub pickup_time: Option<NaiveDateTime>,
    pub dropoff_time: Option<NaiveDateTime>,
    pub anomalies: Vec<AttendanceAnomaly>,
}

impl StudentAttendance {
    pub fn pending(trip_id: TripIdentifier, student_id: StudentIdentifier) -> Self {
        Self {
            trip_id,
            student_id,
            status: AttendanceStatus::Pending,
            pickup_time: None,
            dropoff_time: None,
            anomalies: Vec::new(),
        }
    }
}

/// Append-only breadcrumb of where a trip's bus was
#[derive(Clone, Debug, PartialEq)]
pub struct TrackingEntry {
    pub trip_id: TripIdentifier,
    pub timestamp: NaiveDateTime,
    pub location: Point,
}

// ============================================================================
// Write plans
// ============================================================================

/// Everything one accepted transition wants persisted.
///
/// Applied all-or-nothing, and only if the stored trip is still at
/// `expected_version`.
#[derive(Clone, Debug, PartialEq)]
pub struct TripChangeSet {
    pub expected_version: u64,
    pub trip: Trip,
    pub stops: Vec<TripStop>,
    pub attendance: Vec<StudentAttendance>,
    pub tracking: Vec<TrackingEntry>,
}

impl TripChangeSet {
    /// Start a plan against `snapshot`, with the trip's version already bumped
    pub fn against(snapshot: &TripSnapshot) -> Self {
        let mut trip = snapshot.trip.clone();
        trip.version += 1;
        Self {
            expected_version: snapshot.trip.version,
            trip,
            stops: Vec::new(),
            attendance: Vec::new(),
            tracking: Vec::new(),
        }
    }

    /// A plan that writes nothing (an idempotent repeat)
    pub fn unchanged(snapshot: &TripSnapshot) -> Self {
        Self {
            expected_version: snapshot.trip.version,
            trip: snapshot.trip.clone(),
            stops: Vec::new(),
            attendance: Vec::new(),
            tracking: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.trip.version == self.expected_version
    }

    /// Snapshot as it will look once the plan is applied
    pub fn apply_to(&self, snapshot: &TripSnapshot) -> TripSnapshot {
        let mut stops = snapshot.stops.clone();
        for changed in &self.stops {
            if let Some(stop) = stops.iter_mut().find(|s| s.id == changed.id) {
                *stop = changed.clone();
            }
        }
        TripSnapshot::new(self.trip.clone(), stops)
    }
}
