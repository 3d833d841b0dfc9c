//! Reconciliation of stop arrivals against student assignments.
//!
//! Records are created lazily on the first arrival that concerns a student
//! and only ever move forward. Every function here returns just the records
//! it changed; persisting them is the caller's job.

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::engine::config::EngineConfig;
use crate::identifiers::*;
use crate::models::entities::*;
use crate::models::types::*;

#[derive(Clone, Copy, Debug)]
pub struct AttendanceReconciler {
    auto_pickup: bool,
    auto_dropoff: bool,
}

impl Default for AttendanceReconciler {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl AttendanceReconciler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            auto_pickup: config.auto_pickup_on_arrival,
            auto_dropoff: config.auto_dropoff_on_arrival,
        }
    }

    /// Attendance updates caused by the bus reaching `stop`.
    ///
    /// Only assignments on the trip's route, for this stop point, and
    /// effective on the trip's date are considered. `assignments` may cover
    /// the whole route; `visits` are the trip's stops, used to tell a dropoff
    /// whose pickup stop was skipped (left for `finalize` to mark MISSED) from
    /// a plain dropoff without a recorded pickup.
    pub fn on_stop_arrival(
        &self,
        trip: &Trip,
        stop: &TripStop,
        at: NaiveDateTime,
        assignments: &[StudentAssignment],
        existing: &[StudentAttendance],
        visits: &[TripStop],
    ) -> Vec<StudentAttendance> {
        let mut updates: Vec<StudentAttendance> = Vec::new();

        for assignment in assignments.iter().filter(|a| {
            a.route_id == trip.route_id
                && a.stop_point_id == stop.stop_point_id
                && a.is_effective_on(trip.date)
        }) {
            let known = updates
                .iter()
                .chain(existing.iter())
                .find(|r| r.student_id == assignment.student_id && r.trip_id == trip.id)
                .cloned();
            let is_new = known.is_none();
            let current = known.unwrap_or_else(|| {
                StudentAttendance::pending(trip.id.clone(), assignment.student_id.clone())
            });

            if assignment.direction == Direction::Dropoff
                && current.status != AttendanceStatus::PickedUp
                && pickup_stop_skipped(trip, &assignment.student_id, assignments, visits)
            {
                debug!(
                    trip_id = %trip.id,
                    student_id = %assignment.student_id,
                    "pickup stop was skipped, leaving student for finalize"
                );
                continue;
            }

            let automatic = match assignment.direction {
                Direction::Pickup => self.auto_pickup,
                Direction::Dropoff => self.auto_dropoff,
            };
            let advanced = if automatic {
                advance(&current, assignment.direction, at)
            } else {
                None
            };

            let record = match advanced {
                Some(next) => {
                    if next.anomalies.len() > current.anomalies.len() {
                        warn!(
                            trip_id = %trip.id,
                            student_id = %next.student_id,
                            stop_id = %stop.stop_point_id,
                            "student dropped off without a recorded pickup"
                        );
                    }
                    next
                }
                None if is_new => current,
                None => continue,
            };

            match updates.iter_mut().find(|r| r.student_id == record.student_id) {
                Some(slot) => *slot = record,
                None => updates.push(record),
            }
        }

        debug!(trip_id = %trip.id, stop_id = %stop.stop_point_id, updated = updates.len(), "reconciled arrival");
        updates
    }

    /// Close out attendance when the trip completes.
    ///
    /// PENDING records become MISSED, and every student assigned to the
    /// route that day who was never touched gets a MISSED record.
    pub fn finalize(
        &self,
        trip: &Trip,
        assignments: &[StudentAssignment],
        existing: &[StudentAttendance],
    ) -> Vec<StudentAttendance> {
        let mut updates: BTreeMap<StudentIdentifier, StudentAttendance> = BTreeMap::new();

        for record in existing.iter().filter(|r| r.trip_id == trip.id) {
            if record.status == AttendanceStatus::Pending {
                let mut missed = record.clone();
                missed.status = AttendanceStatus::Missed;
                updates.insert(missed.student_id.clone(), missed);
            }
        }

        let touched: HashSet<&StudentIdentifier> = existing
            .iter()
            .filter(|r| r.trip_id == trip.id)
            .map(|r| &r.student_id)
            .collect();
        for assignment in assignments
            .iter()
            .filter(|a| a.route_id == trip.route_id && a.is_effective_on(trip.date))
            .filter(|a| !touched.contains(&a.student_id))
        {
            updates
                .entry(assignment.student_id.clone())
                .or_insert_with(|| {
                    let mut missed = StudentAttendance::pending(
                        trip.id.clone(),
                        assignment.student_id.clone(),
                    );
                    missed.status = AttendanceStatus::Missed;
                    missed
                });
        }

        updates.into_values().collect()
    }

    /// Driver confirms a student boarded
    pub fn mark_pickup(
        &self,
        trip: &Trip,
        student_id: &StudentIdentifier,
        at: NaiveDateTime,
        assignments: &[StudentAssignment],
        existing: &[StudentAttendance],
    ) -> Result<StudentAttendance> {
        self.mark(trip, student_id, Direction::Pickup, at, assignments, existing)
    }

    /// Driver confirms a student left the bus
    pub fn mark_dropoff(
        &self,
        trip: &Trip,
        student_id: &StudentIdentifier,
        at: NaiveDateTime,
        assignments: &[StudentAssignment],
        existing: &[StudentAttendance],
    ) -> Result<StudentAttendance> {
        self.mark(trip, student_id, Direction::Dropoff, at, assignments, existing)
    }

    fn mark(
        &self,
        trip: &Trip,
        student_id: &StudentIdentifier,
        direction: Direction,
        at: NaiveDateTime,
        assignments: &[StudentAssignment],
        existing: &[StudentAttendance],
    ) -> Result<StudentAttendance> {
        if trip.status != TripStatus::Ongoing {
            return Err(DispatchError::invalid_transition(
                format!("trip {}", trip.id),
                trip.status.as_str(),
                target_status(direction).as_str(),
            ));
        }

        let assigned = assignments.iter().any(|a| {
            &a.student_id == student_id
                && a.route_id == trip.route_id
                && a.is_effective_on(trip.date)
        });
        if !assigned {
            return Err(DispatchError::StudentNotOnTrip {
                trip_id: trip.id.clone(),
                student_id: student_id.clone(),
            });
        }

        let current = existing
            .iter()
            .find(|r| &r.student_id == student_id && r.trip_id == trip.id)
            .cloned()
            .unwrap_or_else(|| StudentAttendance::pending(trip.id.clone(), student_id.clone()));

        advance(&current, direction, at).ok_or_else(|| {
            DispatchError::invalid_transition(
                format!("attendance of student {} on trip {}", student_id, trip.id),
                current.status.as_str(),
                target_status(direction).as_str(),
            )
        })
    }
}

/// Whether every visit of the student's pickup stop on this trip was skipped
fn pickup_stop_skipped(
    trip: &Trip,
    student_id: &StudentIdentifier,
    assignments: &[StudentAssignment],
    visits: &[TripStop],
) -> bool {
    assignments
        .iter()
        .filter(|a| {
            &a.student_id == student_id
                && a.direction == Direction::Pickup
                && a.route_id == trip.route_id
                && a.is_effective_on(trip.date)
        })
        .any(|a| {
            let mut pickups = visits
                .iter()
                .filter(|v| v.stop_point_id == a.stop_point_id)
                .peekable();
            pickups.peek().is_some() && pickups.all(|v| v.status == TripStopStatus::Skipped)
        })
}

fn target_status(direction: Direction) -> AttendanceStatus {
    match direction {
        Direction::Pickup => AttendanceStatus::PickedUp,
        Direction::Dropoff => AttendanceStatus::DroppedOff,
    }
}

/// The record after a pickup/dropoff at `at`, or `None` if it would regress
fn advance(
    current: &StudentAttendance,
    direction: Direction,
    at: NaiveDateTime,
) -> Option<StudentAttendance> {
    let target = target_status(direction);
    if !current.status.can_advance_to(target) {
        return None;
    }

    let mut next = current.clone();
    next.status = target;
    match direction {
        Direction::Pickup => next.pickup_time = Some(at),
        Direction::Dropoff => {
            next.dropoff_time = Some(at);
            if current.status != AttendanceStatus::PickedUp
                && !next.anomalies.contains(&AttendanceAnomaly::DropoffWithoutPickup)
            {
                next.anomalies.push(AttendanceAnomaly::DropoffWithoutPickup);
            }
        }
    }
    Some(next)
}

/// Reject assignment sets where one student holds two overlapping windows
/// for the same direction.
pub fn check_assignment_overlaps(assignments: &[StudentAssignment]) -> Result<()> {
    let mut groups: BTreeMap<(&StudentIdentifier, &str), Vec<&StudentAssignment>> =
        BTreeMap::new();
    for assignment in assignments {
        groups
            .entry((&assignment.student_id, assignment.direction.as_str()))
            .or_default()
            .push(assignment);
    }

    for group in groups.values_mut() {
        group.sort_by_key(|a| a.effective_from);
        // Sorted by start, any overlap shows up between neighbours
        if let Some(pair) = group.windows(2).find(|w| w[0].overlaps(w[1])) {
            return Err(DispatchError::OverlappingAssignment {
                student_id: pair[0].student_id.clone(),
                direction: pair[0].direction,
                first: pair[0].id.clone(),
                second: pair[1].id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn trip_on(day: NaiveDate) -> Trip {
        Trip {
            id: TripIdentifier::new(format!("s1@{}", day)),
            schedule_id: ScheduleIdentifier::new("s1"),
            route_id: RouteIdentifier::new("r1"),
            bus_id: BusIdentifier::new("bus-1"),
            driver_id: DriverIdentifier::new("drv-1"),
            date: day,
            trip_type: TripType::Dispatch,
            status: TripStatus::Ongoing,
            planned_start: day.and_hms_opt(7, 0, 0).unwrap(),
            actual_start_time: day.and_hms_opt(7, 0, 0),
            actual_end_time: None,
            current_stop_id: None,
            location: None,
            cancel_reason: None,
            version: 1,
        }
    }

    fn stop(trip: &Trip, stop_id: &str, sequence: u32) -> TripStop {
        TripStop {
            id: TripStopIdentifier::for_visit(&trip.id, sequence),
            trip_id: trip.id.clone(),
            stop_point_id: StopPointIdentifier::new(stop_id),
            sequence,
            direction: Direction::Pickup,
            status: TripStopStatus::Arrived,
            actual_arrival: None,
            actual_departure: None,
            skip_reason: None,
        }
    }

    fn assignment(id: &str, student: &str, stop: &str, direction: Direction) -> StudentAssignment {
        StudentAssignment {
            id: AssignmentIdentifier::new(id),
            student_id: StudentIdentifier::new(student),
            route_id: RouteIdentifier::new("r1"),
            stop_point_id: StopPointIdentifier::new(stop),
            direction,
            effective_from: date(2024, 1, 1),
            effective_to: Some(date(2024, 2, 1)),
        }
    }

    #[test]
    fn test_pickup_inside_window() {
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let assignments = vec![assignment("a1", "stu01", "A", Direction::Pickup)];

        let updates = AttendanceReconciler::default().on_stop_arrival(
            &trip,
            &stop(&trip, "A", 1),
            at,
            &assignments,
            &[],
            &[],
        );

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, AttendanceStatus::PickedUp);
        assert_eq!(updates[0].pickup_time, Some(at));
        assert!(updates[0].anomalies.is_empty());
    }

    #[test]
    fn test_pickup_outside_window_is_ignored() {
        let trip = trip_on(date(2024, 2, 15));
        let at = date(2024, 2, 15).and_hms_opt(7, 15, 0).unwrap();
        let assignments = vec![assignment("a1", "stu01", "A", Direction::Pickup)];

        let updates = AttendanceReconciler::default().on_stop_arrival(
            &trip,
            &stop(&trip, "A", 1),
            at,
            &assignments,
            &[],
            &[],
        );
        assert!(updates.is_empty());
    }

    #[test]
    fn test_other_stops_and_routes_are_ignored() {
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let mut other_route = assignment("a2", "stu02", "A", Direction::Pickup);
        other_route.route_id = RouteIdentifier::new("r2");
        let assignments = vec![assignment("a1", "stu01", "B", Direction::Pickup), other_route];

        let updates = AttendanceReconciler::default().on_stop_arrival(
            &trip,
            &stop(&trip, "A", 1),
            at,
            &assignments,
            &[],
            &[],
        );
        assert!(updates.is_empty());
    }

    #[test]
    fn test_dropoff_after_pickup() {
        let trip = trip_on(date(2024, 1, 15));
        let pickup_at = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let dropoff_at = date(2024, 1, 15).and_hms_opt(7, 50, 0).unwrap();
        let assignments = vec![
            assignment("a1", "stu01", "A", Direction::Pickup),
            assignment("a2", "stu01", "school", Direction::Dropoff),
        ];
        let reconciler = AttendanceReconciler::default();

        let picked = reconciler.on_stop_arrival(&trip, &stop(&trip, "A", 1), pickup_at, &assignments, &[], &[]);
        let dropped = reconciler.on_stop_arrival(
            &trip,
            &stop(&trip, "school", 2),
            dropoff_at,
            &assignments,
            &picked,
            &[],
        );

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].status, AttendanceStatus::DroppedOff);
        assert_eq!(dropped[0].pickup_time, Some(pickup_at));
        assert_eq!(dropped[0].dropoff_time, Some(dropoff_at));
        assert!(dropped[0].anomalies.is_empty());
    }

    #[test]
    fn test_dropoff_without_pickup_is_flagged() {
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(16, 0, 0).unwrap();
        let assignments = vec![assignment("a1", "stu01", "home", Direction::Dropoff)];

        let updates = AttendanceReconciler::default().on_stop_arrival(
            &trip,
            &stop(&trip, "home", 4),
            at,
            &assignments,
            &[],
            &[],
        );

        assert_eq!(updates[0].status, AttendanceStatus::DroppedOff);
        assert_eq!(updates[0].anomalies, vec![AttendanceAnomaly::DropoffWithoutPickup]);
    }

    #[test]
    fn test_skipped_pickup_stop_ends_missed() {
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 50, 0).unwrap();
        let assignments = vec![
            assignment("a1", "stu01", "A", Direction::Pickup),
            assignment("a2", "stu01", "school", Direction::Dropoff),
        ];
        let mut skipped = stop(&trip, "A", 1);
        skipped.status = TripStopStatus::Skipped;
        let school = stop(&trip, "school", 2);
        let visits = vec![skipped, school.clone()];
        let reconciler = AttendanceReconciler::default();

        let updates = reconciler.on_stop_arrival(&trip, &school, at, &assignments, &[], &visits);
        assert!(updates.is_empty());

        let finalized = reconciler.finalize(&trip, &assignments, &updates);
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].student_id.as_str(), "stu01");
        assert_eq!(finalized[0].status, AttendanceStatus::Missed);
    }

    #[test]
    fn test_visited_pickup_without_mark_still_drops_off() {
        let config = EngineConfig {
            auto_pickup_on_arrival: false,
            ..Default::default()
        };
        let reconciler = AttendanceReconciler::new(&config);
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 50, 0).unwrap();
        let assignments = vec![
            assignment("a1", "stu01", "A", Direction::Pickup),
            assignment("a2", "stu01", "school", Direction::Dropoff),
        ];
        let mut visited = stop(&trip, "A", 1);
        visited.status = TripStopStatus::Done;
        let school = stop(&trip, "school", 2);
        let visits = vec![visited.clone(), school.clone()];

        let opened = reconciler.on_stop_arrival(&trip, &visited, at, &assignments, &[], &visits);
        let dropped = reconciler.on_stop_arrival(&trip, &school, at, &assignments, &opened, &visits);
        assert_eq!(dropped[0].status, AttendanceStatus::DroppedOff);
        assert_eq!(dropped[0].anomalies, vec![AttendanceAnomaly::DropoffWithoutPickup]);
    }

    #[test]
    fn test_repeat_arrival_does_not_regress() {
        let trip = trip_on(date(2024, 1, 15));
        let first = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let later = date(2024, 1, 15).and_hms_opt(7, 40, 0).unwrap();
        let assignments = vec![assignment("a1", "stu01", "A", Direction::Pickup)];
        let reconciler = AttendanceReconciler::default();

        let existing = reconciler.on_stop_arrival(&trip, &stop(&trip, "A", 1), first, &assignments, &[], &[]);
        let again = reconciler.on_stop_arrival(&trip, &stop(&trip, "A", 5), later, &assignments, &existing, &[]);
        assert!(again.is_empty());
    }

    #[test]
    fn test_manual_mode_opens_pending_records() {
        let config = EngineConfig {
            auto_pickup_on_arrival: false,
            ..Default::default()
        };
        let reconciler = AttendanceReconciler::new(&config);
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let assignments = vec![assignment("a1", "stu01", "A", Direction::Pickup)];

        let opened = reconciler.on_stop_arrival(&trip, &stop(&trip, "A", 1), at, &assignments, &[], &[]);
        assert_eq!(opened[0].status, AttendanceStatus::Pending);

        let picked = reconciler
            .mark_pickup(&trip, &StudentIdentifier::new("stu01"), at, &assignments, &opened)
            .unwrap();
        assert_eq!(picked.status, AttendanceStatus::PickedUp);
        assert_eq!(picked.pickup_time, Some(at));

        // Re-opening the same stop leaves the open record alone
        let again = reconciler.on_stop_arrival(&trip, &stop(&trip, "A", 1), at, &assignments, &opened, &[]);
        assert!(again.is_empty());
    }

    #[test]
    fn test_manual_marks_are_validated() {
        let reconciler = AttendanceReconciler::default();
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let assignments = vec![assignment("a1", "stu01", "A", Direction::Pickup)];

        let stranger = reconciler.mark_pickup(&trip, &StudentIdentifier::new("stu99"), at, &assignments, &[]);
        assert!(matches!(stranger, Err(DispatchError::StudentNotOnTrip { .. })));

        let mut dropped = StudentAttendance::pending(trip.id.clone(), StudentIdentifier::new("stu01"));
        dropped.status = AttendanceStatus::DroppedOff;
        let regress = reconciler.mark_pickup(&trip, &StudentIdentifier::new("stu01"), at, &assignments, &[dropped]);
        assert!(matches!(regress, Err(DispatchError::InvalidTransition { .. })));

        let mut planned = trip.clone();
        planned.status = TripStatus::Planned;
        let early = reconciler.mark_pickup(&planned, &StudentIdentifier::new("stu01"), at, &assignments, &[]);
        assert!(matches!(early, Err(DispatchError::InvalidTransition { .. })));
    }

    #[test]
    fn test_finalize_marks_missing_students() {
        let reconciler = AttendanceReconciler::default();
        let trip = trip_on(date(2024, 1, 15));
        let at = date(2024, 1, 15).and_hms_opt(7, 15, 0).unwrap();
        let assignments = vec![
            assignment("a1", "stu01", "A", Direction::Pickup),
            assignment("a2", "stu02", "B", Direction::Pickup),
            assignment("a3", "stu03", "C", Direction::Pickup),
        ];

        let picked = reconciler.on_stop_arrival(&trip, &stop(&trip, "A", 1), at, &assignments, &[], &[]);
        let pending = StudentAttendance::pending(trip.id.clone(), StudentIdentifier::new("stu02"));
        let existing: Vec<_> = picked.into_iter().chain([pending]).collect();

        let finalized = reconciler.finalize(&trip, &assignments, &existing);
        let summary: Vec<_> = finalized
            .iter()
            .map(|r| (r.student_id.as_str(), r.status))
            .collect();
        assert_eq!(
            summary,
            vec![("stu02", AttendanceStatus::Missed), ("stu03", AttendanceStatus::Missed)]
        );
    }

    #[test]
    fn test_overlapping_assignments_are_rejected() {
        let first = assignment("a1", "stu01", "A", Direction::Pickup);
        let mut moved = assignment("a2", "stu01", "B", Direction::Pickup);
        moved.effective_from = date(2024, 1, 20);
        moved.effective_to = None;

        let err = check_assignment_overlaps(&[first.clone(), moved.clone()]).unwrap_err();
        assert!(matches!(err, DispatchError::OverlappingAssignment { .. }));

        // Same window, other direction is fine
        let dropoff = assignment("a3", "stu01", "school", Direction::Dropoff);
        assert!(check_assignment_overlaps(&[first.clone(), dropoff]).is_ok());

        // Back-to-back windows are fine
        moved.effective_from = date(2024, 2, 1);
        assert!(check_assignment_overlaps(&[moved, first]).is_ok());
    }
}
