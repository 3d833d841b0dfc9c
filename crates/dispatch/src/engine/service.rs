//! Repository-backed entry points for callers.
//!
//! `DispatchService` loads the state an operation needs, runs the pure
//! engine on it, and persists the resulting change set with one atomic
//! `apply`. A `ConcurrentModification` from the repository is returned to the
//! caller untouched, except in `pump` where location pings are retried.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use geo::Point;
use tracing::{debug, info, warn};

use crate::engine::attendance::AttendanceReconciler;
use crate::engine::clock::{Clock, SystemClock};
use crate::engine::config::EngineConfig;
use crate::engine::materializer::{Materialization, TripMaterializer};
use crate::engine::resolver::CalendarRecurrenceResolver;
use crate::engine::state_machine::{Roster, TripStateMachine};
use crate::identifiers::*;
use crate::ingest::traits::{LocationEvent, LocationSource};
use crate::models::calendar::DateRange;
use crate::models::entities::*;
use crate::models::traits::DispatchRepository;
use crate::models::types::*;
use crate::spatial::polyline;
use crate::spatial::queries::haversine_distance;

/// Attempts per location event before a version conflict is given up on
const MAX_CONFLICT_RETRIES: usize = 3;

/// Result of materializing many schedules at once
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterializationReport {
    pub created: Vec<TripIdentifier>,
    pub skipped: usize,
    /// Schedules whose route data is unusable; nothing was created for them
    pub flagged: Vec<ScheduleIdentifier>,
}

/// The bus is within the arrival radius of its next pending stop
#[derive(Clone, Debug, PartialEq)]
pub struct StopProximity {
    pub stop_id: StopPointIdentifier,
    pub sequence: u32,
    pub distance_m: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocationUpdate {
    pub trip: Trip,
    pub at_stop: Option<StopProximity>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub applied: usize,
    pub rejected: usize,
    /// Applied events that put the bus at its next stop
    pub arrivals_detected: usize,
}

pub struct DispatchService<R, C = SystemClock> {
    repo: R,
    clock: C,
    config: EngineConfig,
    resolver: CalendarRecurrenceResolver,
    materializer: TripMaterializer,
    machine: TripStateMachine,
}

impl<R: DispatchRepository> DispatchService<R, SystemClock> {
    pub fn with_system_clock(repo: R, config: EngineConfig) -> Result<Self> {
        Self::new(repo, SystemClock, config)
    }
}

impl<R: DispatchRepository, C: Clock> DispatchService<R, C> {
    pub fn new(repo: R, clock: C, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let machine = TripStateMachine::new(AttendanceReconciler::new(&config));
        Ok(Self {
            repo,
            clock,
            config,
            resolver: CalendarRecurrenceResolver::new(),
            materializer: TripMaterializer::new(),
            machine,
        })
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Materialization
    // ========================================================================

    /// Create the missing trips of one schedule for `start..=end`
    pub fn materialize_schedule(
        &self,
        schedule_id: &ScheduleIdentifier,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Materialization> {
        let schedule = self.repo.get_schedule(schedule_id)?;
        let dates = self.resolver.resolve_dates(&schedule, start, end)?;
        let route_stops = self.repo.route_stop_points(&schedule.route_id)?;

        let planned = self.materializer.materialize(&schedule, &route_stops, dates, |date| {
            Ok(self
                .repo
                .find_trip_by_schedule_and_date(&schedule.id, date)?
                .is_some())
        })?;

        let mut result = Materialization {
            created: Vec::with_capacity(planned.created.len()),
            skipped: planned.skipped,
        };
        for snapshot in planned.created {
            match self.repo.insert_trip(&snapshot) {
                Ok(()) => result.created.push(snapshot),
                // Another materializer got there first
                Err(DispatchError::DuplicateTrip { date, .. }) => result.skipped.push(date),
                Err(e) => return Err(e),
            }
        }

        info!(
            schedule_id = %schedule.id,
            created = result.created.len(),
            skipped = result.skipped.len(),
            "materialized schedule"
        );
        Ok(result)
    }

    /// Materialize every active schedule, flagging the ones with broken
    /// route data instead of aborting.
    pub fn materialize_all(&self, start: NaiveDate, end: NaiveDate) -> Result<MaterializationReport> {
        DateRange::new(start, end)?;

        let mut report = MaterializationReport::default();
        for schedule in self.repo.active_schedules()? {
            match self.materialize_schedule(&schedule.id, start, end) {
                Ok(result) => {
                    report
                        .created
                        .extend(result.created.into_iter().map(|s| s.trip.id));
                    report.skipped += result.skipped.len();
                }
                Err(e) if e.kind() == ErrorKind::DataIntegrity => {
                    warn!(schedule_id = %schedule.id, error = %e, "schedule flagged");
                    report.flagged.push(schedule.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// `materialize_all` over the configured horizon starting today
    pub fn materialize_horizon(&self) -> Result<MaterializationReport> {
        let start = self.clock.today();
        let end = start + Duration::days(i64::from(self.config.materialization_horizon_days) - 1);
        self.materialize_all(start, end)
    }

    // ========================================================================
    // Trip lifecycle
    // ========================================================================

    pub fn start_trip(&self, trip_id: &TripIdentifier) -> Result<TripSnapshot> {
        let at = self.clock.now();
        self.transition(trip_id, "start", |snapshot| self.machine.start(snapshot, at))
    }

    /// The bus reached `stop_id` now; reconciles the students assigned there
    pub fn record_arrival(
        &self,
        trip_id: &TripIdentifier,
        stop_id: &StopPointIdentifier,
        location: Point,
    ) -> Result<TripSnapshot> {
        self.record_arrival_at(trip_id, stop_id, self.clock.now(), location)
    }

    /// Arrival reported with the device's own timestamp, for buffered events
    pub fn record_arrival_at(
        &self,
        trip_id: &TripIdentifier,
        stop_id: &StopPointIdentifier,
        at: NaiveDateTime,
        location: Point,
    ) -> Result<TripSnapshot> {
        self.transition(trip_id, "arrive", |snapshot| {
            let trip = &snapshot.trip;
            // Route-wide, so a dropoff can see whether its pickup stop was skipped
            let assignments = self
                .repo
                .find_active_assignments_for_route(&trip.route_id, trip.date)?;
            let attendance = self.repo.attendance_for_trip(&trip.id)?;
            self.machine.record_arrival(
                snapshot,
                stop_id,
                at,
                location,
                Roster::new(&assignments, &attendance),
            )
        })
    }

    pub fn record_departure(
        &self,
        trip_id: &TripIdentifier,
        stop_id: &StopPointIdentifier,
    ) -> Result<TripSnapshot> {
        self.record_departure_at(trip_id, stop_id, self.clock.now())
    }

    pub fn record_departure_at(
        &self,
        trip_id: &TripIdentifier,
        stop_id: &StopPointIdentifier,
        at: NaiveDateTime,
    ) -> Result<TripSnapshot> {
        self.transition(trip_id, "depart", |snapshot| {
            self.machine.record_departure(snapshot, stop_id, at)
        })
    }

    pub fn skip_stop(
        &self,
        trip_id: &TripIdentifier,
        stop_id: &StopPointIdentifier,
        reason: &str,
    ) -> Result<TripSnapshot> {
        self.transition(trip_id, "skip", |snapshot| self.machine.skip(snapshot, stop_id, reason))
    }

    /// Finish the trip; students never picked up become MISSED
    pub fn complete_trip(&self, trip_id: &TripIdentifier) -> Result<TripSnapshot> {
        let at = self.clock.now();
        self.transition(trip_id, "complete", |snapshot| {
            let trip = &snapshot.trip;
            let assignments = self
                .repo
                .find_active_assignments_for_route(&trip.route_id, trip.date)?;
            let attendance = self.repo.attendance_for_trip(&trip.id)?;
            self.machine
                .complete(snapshot, at, Roster::new(&assignments, &attendance))
        })
    }

    pub fn cancel_trip(&self, trip_id: &TripIdentifier, reason: &str) -> Result<TripSnapshot> {
        let at = self.clock.now();
        self.transition(trip_id, "cancel", |snapshot| self.machine.cancel(snapshot, reason, at))
    }

    /// Load, plan, apply. Returns the snapshot as persisted.
    fn transition<F>(&self, trip_id: &TripIdentifier, op: &str, plan: F) -> Result<TripSnapshot>
    where
        F: FnOnce(&TripSnapshot) -> Result<TripChangeSet>,
    {
        let snapshot = self.repo.load_trip(trip_id)?;
        let changes = plan(&snapshot)?;
        if changes.is_noop() {
            debug!(trip_id = %trip_id, op, "transition changed nothing");
            return Ok(snapshot);
        }

        self.repo.apply(&changes)?;
        info!(
            trip_id = %trip_id,
            op,
            status = %changes.trip.status,
            version = changes.trip.version,
            "trip updated"
        );
        Ok(changes.apply_to(&snapshot))
    }

    // ========================================================================
    // Location
    // ========================================================================

    /// Record a position ping taken now
    pub fn update_location(&self, trip_id: &TripIdentifier, location: Point) -> Result<LocationUpdate> {
        self.ingest(&LocationEvent {
            trip_id: trip_id.clone(),
            timestamp: self.clock.now(),
            location,
        })
    }

    /// Record a position ping and report whether the bus is at its next stop.
    ///
    /// Never moves a stop to ARRIVED by itself; the driver confirms arrivals.
    pub fn ingest(&self, event: &LocationEvent) -> Result<LocationUpdate> {
        let updated = self.transition(&event.trip_id, "locate", |snapshot| {
            self.machine
                .update_location(snapshot, event.timestamp, event.location)
        })?;

        let at_stop = updated.next_pending().and_then(|next| {
            self.repo
                .stop_points_near(event.location, self.config.arrival_radius_m)
                .into_iter()
                .find(|stop| stop.id == next.stop_point_id)
                .map(|stop| StopProximity {
                    distance_m: haversine_distance(event.location, stop.location),
                    stop_id: stop.id,
                    sequence: next.sequence,
                })
        });
        if let Some(proximity) = &at_stop {
            debug!(
                trip_id = %event.trip_id,
                stop_id = %proximity.stop_id,
                distance_m = proximity.distance_m,
                "bus is at its next stop"
            );
        }

        Ok(LocationUpdate {
            trip: updated.trip,
            at_stop,
        })
    }

    /// Drain a location source.
    ///
    /// Events for unknown or non-ongoing trips are counted as rejected and
    /// logged. Version conflicts are retried from fresh state. Storage
    /// failures abort the pump.
    pub async fn pump<S>(&self, source: &S) -> Result<IngestReport>
    where
        S: LocationSource + ?Sized,
    {
        let mut report = IngestReport::default();
        loop {
            let batch = source.next_batch().await?;
            if batch.is_empty() {
                break;
            }

            for event in &batch {
                match self.ingest_with_retry(event) {
                    Ok(update) => {
                        report.applied += 1;
                        if update.at_stop.is_some() {
                            report.arrivals_detected += 1;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Storage => return Err(e),
                    Err(e) => {
                        warn!(trip_id = %event.trip_id, error = %e, "location event rejected");
                        report.rejected += 1;
                    }
                }
            }
        }

        info!(
            applied = report.applied,
            rejected = report.rejected,
            arrivals = report.arrivals_detected,
            "location source drained"
        );
        Ok(report)
    }

    fn ingest_with_retry(&self, event: &LocationEvent) -> Result<LocationUpdate> {
        let mut attempt = 1;
        loop {
            match self.ingest(event) {
                Err(e) if e.kind() == ErrorKind::Concurrency && attempt < MAX_CONFLICT_RETRIES => {
                    debug!(trip_id = %event.trip_id, attempt, "retrying location event");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ========================================================================
    // Attendance
    // ========================================================================

    /// Driver confirms a student boarded
    pub fn mark_pickup(
        &self,
        trip_id: &TripIdentifier,
        student_id: &StudentIdentifier,
    ) -> Result<StudentAttendance> {
        self.mark(trip_id, student_id, Direction::Pickup)
    }

    /// Driver confirms a student left the bus
    pub fn mark_dropoff(
        &self,
        trip_id: &TripIdentifier,
        student_id: &StudentIdentifier,
    ) -> Result<StudentAttendance> {
        self.mark(trip_id, student_id, Direction::Dropoff)
    }

    fn mark(
        &self,
        trip_id: &TripIdentifier,
        student_id: &StudentIdentifier,
        direction: Direction,
    ) -> Result<StudentAttendance> {
        let at = self.clock.now();
        let snapshot = self.repo.load_trip(trip_id)?;
        let trip = &snapshot.trip;
        let assignments = self
            .repo
            .find_active_assignments_for_route(&trip.route_id, trip.date)?;
        let attendance = self.repo.attendance_for_trip(trip_id)?;

        let reconciler = self.machine.reconciler();
        let record = match direction {
            Direction::Pickup => {
                reconciler.mark_pickup(trip, student_id, at, &assignments, &attendance)?
            }
            Direction::Dropoff => {
                reconciler.mark_dropoff(trip, student_id, at, &assignments, &attendance)?
            }
        };

        // Goes through the trip version like any other write to the trip
        let mut changes = TripChangeSet::against(&snapshot);
        changes.attendance.push(record.clone());
        self.repo.apply(&changes)?;
        info!(
            trip_id = %trip_id,
            student_id = %student_id,
            status = %record.status,
            "attendance marked"
        );
        Ok(record)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn trips_on(&self, date: NaiveDate) -> Result<Vec<Trip>> {
        self.repo.trips_on(date)
    }

    pub fn trip(&self, trip_id: &TripIdentifier) -> Result<TripSnapshot> {
        self.repo.load_trip(trip_id)
    }

    pub fn attendance_for_trip(&self, trip_id: &TripIdentifier) -> Result<Vec<StudentAttendance>> {
        self.repo.attendance_for_trip(trip_id)
    }

    /// Recorded track of a trip as an encoded polyline
    pub fn trip_path(&self, trip_id: &TripIdentifier) -> Result<String> {
        self.repo.load_trip(trip_id)?;
        let mut tracking = self.repo.tracking_for_trip(trip_id)?;
        tracking.sort_by_key(|entry| entry.timestamp);

        let points: Vec<Point> = tracking.iter().map(|entry| entry.location).collect();
        Ok(polyline::encode(&points, polyline::DEFAULT_PRECISION))
    }
}
