//! Trip and trip-stop lifecycle.
//!
//! ```text
//! trip:  PLANNED -> ONGOING -> COMPLETED
//!           \          \
//!            +----------+----> CANCELLED
//!
//! stop:  PENDING -> ARRIVED -> DONE
//!           \
//!            +---> SKIPPED
//! ```
//!
//! Every operation reads a `TripSnapshot` and returns a `TripChangeSet`
//! describing the writes; the snapshot itself is never touched, so a
//! rejected transition leaves nothing half-applied.

use chrono::NaiveDateTime;
use geo::Point;
use std::sync::Arc;

use crate::engine::attendance::AttendanceReconciler;
use crate::identifiers::*;
use crate::models::entities::*;
use crate::models::types::*;

/// Students that a transition may have to reconcile
#[derive(Clone, Copy, Debug, Default)]
pub struct Roster<'a> {
    pub assignments: &'a [StudentAssignment],
    pub attendance: &'a [StudentAttendance],
}

impl<'a> Roster<'a> {
    pub fn new(assignments: &'a [StudentAssignment], attendance: &'a [StudentAttendance]) -> Self {
        Self {
            assignments,
            attendance,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TripStateMachine {
    reconciler: AttendanceReconciler,
}

impl TripStateMachine {
    pub fn new(reconciler: AttendanceReconciler) -> Self {
        Self { reconciler }
    }

    pub fn reconciler(&self) -> &AttendanceReconciler {
        &self.reconciler
    }

    /// PLANNED -> ONGOING
    pub fn start(&self, snapshot: &TripSnapshot, at: NaiveDateTime) -> Result<TripChangeSet> {
        require_trip(snapshot, &[TripStatus::Planned], TripStatus::Ongoing)?;

        let mut changes = TripChangeSet::against(snapshot);
        changes.trip.status = TripStatus::Ongoing;
        changes.trip.actual_start_time = Some(at);
        Ok(changes)
    }

    /// PENDING -> ARRIVED for the next stop in sequence.
    ///
    /// The stop must be the lowest-sequence PENDING visit; an arrival at any
    /// later PENDING visit is `OutOfSequence`. Students assigned to the stop
    /// are reconciled as part of the same change set.
    pub fn record_arrival(
        &self,
        snapshot: &TripSnapshot,
        stop_id: &StopPointIdentifier,
        at: NaiveDateTime,
        location: Point,
        roster: Roster<'_>,
    ) -> Result<TripChangeSet> {
        require_trip(snapshot, &[TripStatus::Ongoing], TripStatus::Ongoing)?;
        not_before_start(snapshot, at)?;

        let next = snapshot.next_pending();
        let visit = match next {
            Some(stop) if &stop.stop_point_id == stop_id => stop,
            _ => {
                return Err(self.misplaced_arrival(snapshot, stop_id, next));
            }
        };

        let mut arrived = visit.clone();
        arrived.status = TripStopStatus::Arrived;
        arrived.actual_arrival = Some(at);

        let mut changes = TripChangeSet::against(snapshot);
        changes.trip.current_stop_id = Some(stop_id.clone());
        changes.trip.location = Some(location);
        changes.attendance = self.reconciler.on_stop_arrival(
            &snapshot.trip,
            &arrived,
            at,
            roster.assignments,
            roster.attendance,
            &snapshot.stops,
        );
        changes.tracking.push(TrackingEntry {
            trip_id: snapshot.trip.id.clone(),
            timestamp: at,
            location,
        });
        changes.stops.push(arrived);
        Ok(changes)
    }

    /// ARRIVED -> DONE for the visit the bus is currently at
    pub fn record_departure(
        &self,
        snapshot: &TripSnapshot,
        stop_id: &StopPointIdentifier,
        at: NaiveDateTime,
    ) -> Result<TripChangeSet> {
        require_trip(snapshot, &[TripStatus::Ongoing], TripStatus::Ongoing)?;

        let visit = self.find_visit(snapshot, stop_id, TripStopStatus::Arrived, TripStopStatus::Done)?;
        if visit.actual_arrival.map_or(false, |arrival| at < arrival) {
            return Err(DispatchError::InvalidTimestamp(format!(
                "departure from {} at {} precedes its arrival",
                stop_id, at
            )));
        }

        let mut done = visit.clone();
        done.status = TripStopStatus::Done;
        done.actual_departure = Some(at);

        let mut changes = TripChangeSet::against(snapshot);
        changes.stops.push(done);
        Ok(changes)
    }

    /// PENDING -> SKIPPED; later stops stay reachable
    pub fn skip(
        &self,
        snapshot: &TripSnapshot,
        stop_id: &StopPointIdentifier,
        reason: &str,
    ) -> Result<TripChangeSet> {
        require_trip(
            snapshot,
            &[TripStatus::Planned, TripStatus::Ongoing],
            TripStatus::Ongoing,
        )?;

        let visit = self.find_visit(snapshot, stop_id, TripStopStatus::Pending, TripStopStatus::Skipped)?;
        let mut skipped = visit.clone();
        skipped.status = TripStopStatus::Skipped;
        skipped.skip_reason = Some(Arc::from(reason));

        let mut changes = TripChangeSet::against(snapshot);
        changes.stops.push(skipped);
        Ok(changes)
    }

    /// ONGOING -> COMPLETED once every visit is DONE or SKIPPED.
    ///
    /// Attendance still PENDING, and assigned students never seen, become
    /// MISSED in the same change set.
    pub fn complete(
        &self,
        snapshot: &TripSnapshot,
        at: NaiveDateTime,
        roster: Roster<'_>,
    ) -> Result<TripChangeSet> {
        require_trip(snapshot, &[TripStatus::Ongoing], TripStatus::Completed)?;

        let unfinished: Vec<TripStopIdentifier> =
            snapshot.unfinished().map(|s| s.id.clone()).collect();
        if !unfinished.is_empty() {
            return Err(DispatchError::IncompleteTrip {
                trip_id: snapshot.trip.id.clone(),
                unfinished,
            });
        }
        not_before_start(snapshot, at)?;

        let mut changes = TripChangeSet::against(snapshot);
        changes.trip.status = TripStatus::Completed;
        changes.trip.actual_end_time = Some(at);
        changes.attendance =
            self.reconciler
                .finalize(&snapshot.trip, roster.assignments, roster.attendance);
        Ok(changes)
    }

    /// PLANNED/ONGOING -> CANCELLED, skipping every unfinished visit.
    ///
    /// Cancelling a cancelled trip returns an empty change set.
    pub fn cancel(
        &self,
        snapshot: &TripSnapshot,
        reason: &str,
        at: NaiveDateTime,
    ) -> Result<TripChangeSet> {
        if snapshot.trip.status == TripStatus::Cancelled {
            return Ok(TripChangeSet::unchanged(snapshot));
        }
        require_trip(
            snapshot,
            &[TripStatus::Planned, TripStatus::Ongoing],
            TripStatus::Cancelled,
        )?;

        let mut changes = TripChangeSet::against(snapshot);
        changes.trip.status = TripStatus::Cancelled;
        changes.trip.cancel_reason = Some(Arc::from(reason));
        if snapshot.trip.actual_start_time.is_some() {
            changes.trip.actual_end_time = Some(at);
        }
        changes.stops = snapshot
            .unfinished()
            .map(|stop| {
                let mut skipped = stop.clone();
                skipped.status = TripStopStatus::Skipped;
                skipped.skip_reason = Some(Arc::from(reason));
                skipped
            })
            .collect();
        Ok(changes)
    }

    /// Record a position ping of an ongoing trip
    pub fn update_location(
        &self,
        snapshot: &TripSnapshot,
        at: NaiveDateTime,
        location: Point,
    ) -> Result<TripChangeSet> {
        require_trip(snapshot, &[TripStatus::Ongoing], TripStatus::Ongoing)?;

        let mut changes = TripChangeSet::against(snapshot);
        changes.trip.location = Some(location);
        changes.tracking.push(TrackingEntry {
            trip_id: snapshot.trip.id.clone(),
            timestamp: at,
            location,
        });
        Ok(changes)
    }

    /// Lowest-sequence visit of `stop_id` in state `from`, or the reason
    /// there is none.
    fn find_visit<'s>(
        &self,
        snapshot: &'s TripSnapshot,
        stop_id: &StopPointIdentifier,
        from: TripStopStatus,
        to: TripStopStatus,
    ) -> Result<&'s TripStop> {
        let mut visits = snapshot.visits_of(stop_id).peekable();
        let Some(first) = visits.peek().copied() else {
            return Err(DispatchError::StopNotOnTrip {
                trip_id: snapshot.trip.id.clone(),
                stop_id: stop_id.clone(),
            });
        };

        visits.find(|s| s.status == from).ok_or_else(|| {
            DispatchError::invalid_transition(
                format!("stop {} of trip {}", stop_id, snapshot.trip.id),
                first.status.as_str(),
                to.as_str(),
            )
        })
    }

    fn misplaced_arrival(
        &self,
        snapshot: &TripSnapshot,
        stop_id: &StopPointIdentifier,
        next: Option<&TripStop>,
    ) -> DispatchError {
        let mut visits = snapshot.visits_of(stop_id).peekable();
        let Some(first) = visits.peek().copied() else {
            return DispatchError::StopNotOnTrip {
                trip_id: snapshot.trip.id.clone(),
                stop_id: stop_id.clone(),
            };
        };

        if visits.any(|s| s.status == TripStopStatus::Pending) {
            DispatchError::OutOfSequence {
                trip_id: snapshot.trip.id.clone(),
                stop_id: stop_id.clone(),
                expected: next.map(|s| s.stop_point_id.clone()),
            }
        } else {
            DispatchError::invalid_transition(
                format!("stop {} of trip {}", stop_id, snapshot.trip.id),
                first.status.as_str(),
                TripStopStatus::Arrived.as_str(),
            )
        }
    }
}

fn require_trip(snapshot: &TripSnapshot, allowed: &[TripStatus], to: TripStatus) -> Result<()> {
    let status = snapshot.trip.status;
    if allowed.contains(&status) {
        return Ok(());
    }
    Err(DispatchError::invalid_transition(
        format!("trip {}", snapshot.trip.id),
        status.as_str(),
        to.as_str(),
    ))
}

fn not_before_start(snapshot: &TripSnapshot, at: NaiveDateTime) -> Result<()> {
    match snapshot.trip.actual_start_time {
        Some(started) if at < started => Err(DispatchError::InvalidTimestamp(format!(
            "{} is before trip {} started at {}",
            at, snapshot.trip.id, started
        ))),
        _ => Ok(()),
    }
}
