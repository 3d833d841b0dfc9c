//! Creation of concrete trips from a schedule's service dates.

use chrono::NaiveDate;
use std::collections::HashSet;

use crate::identifiers::*;
use crate::models::entities::*;
use crate::models::types::*;

/// Outcome of one materialization run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Materialization {
    /// New trips, each with its full stop sequence, ready for `insert_trip`
    pub created: Vec<TripSnapshot>,
    /// Dates that already had a trip (or were listed twice)
    pub skipped: Vec<NaiveDate>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TripMaterializer;

impl TripMaterializer {
    pub fn new() -> Self {
        Self
    }

    /// Plan one trip per date that does not have one yet.
    ///
    /// `trip_exists` answers whether `(schedule, date)` already has a trip.
    /// Fails with `RouteEmpty` when there is at least one date but the route
    /// has no active stop points, and with `InvalidData` when two active stop
    /// points share a sequence number.
    pub fn materialize<I, F>(
        &self,
        schedule: &Schedule,
        route_stops: &[RouteStopPoint],
        dates: I,
        mut trip_exists: F,
    ) -> Result<Materialization>
    where
        I: IntoIterator<Item = NaiveDate>,
        F: FnMut(NaiveDate) -> Result<bool>,
    {
        let mut dates = dates.into_iter().peekable();
        if dates.peek().is_none() {
            return Ok(Materialization::default());
        }

        let ordering = self.stop_ordering(schedule, route_stops)?;

        let mut result = Materialization::default();
        let mut seen = HashSet::new();
        for date in dates {
            if !seen.insert(date) || trip_exists(date)? {
                result.skipped.push(date);
                continue;
            }
            result.created.push(self.build_trip(schedule, &ordering, date));
        }
        Ok(result)
    }

    /// Active stop points of the route, ordered by sequence
    pub fn stop_ordering<'a>(
        &self,
        schedule: &Schedule,
        route_stops: &'a [RouteStopPoint],
    ) -> Result<Vec<&'a RouteStopPoint>> {
        let mut ordering: Vec<_> = route_stops
            .iter()
            .filter(|rs| rs.active && rs.route_id == schedule.route_id)
            .collect();

        if ordering.is_empty() {
            return Err(DispatchError::RouteEmpty {
                schedule_id: schedule.id.clone(),
                route_id: schedule.route_id.clone(),
            });
        }

        ordering.sort_by_key(|rs| rs.sequence);
        if let Some(pair) = ordering.windows(2).find(|w| w[0].sequence == w[1].sequence) {
            return Err(DispatchError::InvalidData(format!(
                "route {} lists stops {} and {} at the same sequence {}",
                schedule.route_id, pair[0].stop_point_id, pair[1].stop_point_id, pair[0].sequence
            )));
        }
        Ok(ordering)
    }

    fn build_trip(
        &self,
        schedule: &Schedule,
        ordering: &[&RouteStopPoint],
        date: NaiveDate,
    ) -> TripSnapshot {
        let trip_id = TripIdentifier::for_schedule(&schedule.id, date);

        let stops = ordering
            .iter()
            .map(|rs| TripStop {
                id: TripStopIdentifier::for_visit(&trip_id, rs.sequence),
                trip_id: trip_id.clone(),
                stop_point_id: rs.stop_point_id.clone(),
                sequence: rs.sequence,
                direction: rs.direction,
                status: TripStopStatus::Pending,
                actual_arrival: None,
                actual_departure: None,
                skip_reason: None,
            })
            .collect();

        let trip = Trip {
            id: trip_id,
            schedule_id: schedule.id.clone(),
            route_id: schedule.route_id.clone(),
            bus_id: schedule.bus_id.clone(),
            driver_id: schedule.driver_id.clone(),
            date,
            trip_type: schedule.schedule_type.trip_type(),
            status: TripStatus::Planned,
            planned_start: date.and_time(schedule.start_time),
            actual_start_time: None,
            actual_end_time: None,
            current_stop_id: None,
            location: None,
            cancel_reason: None,
            version: 0,
        };

        TripSnapshot::new(trip, stops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calendar::WeekdayFlags;
    use chrono::NaiveTime;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn schedule() -> Schedule {
        Schedule {
            id: ScheduleIdentifier::new("s1"),
            bus_id: BusIdentifier::new("bus-1"),
            driver_id: DriverIdentifier::new("drv-1"),
            route_id: RouteIdentifier::new("r1"),
            schedule_type: ScheduleType::Afternoon,
            days_of_week: WeekdayFlags::from_bits(WeekdayFlags::ALL),
            start_time: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            start_date: date(2024, 1, 1),
            end_date: date(2024, 12, 31),
            status: ScheduleStatus::Active,
        }
    }

    fn route_stop(stop: &str, sequence: u32, direction: Direction, active: bool) -> RouteStopPoint {
        RouteStopPoint {
            route_id: RouteIdentifier::new("r1"),
            stop_point_id: StopPointIdentifier::new(stop),
            sequence,
            direction,
            active,
        }
    }

    fn route() -> Vec<RouteStopPoint> {
        vec![
            route_stop("school", 3, Direction::Dropoff, true),
            route_stop("A", 1, Direction::Pickup, true),
            route_stop("closed", 2, Direction::Pickup, false),
            route_stop("B", 2, Direction::Pickup, true),
        ]
    }

    #[test]
    fn test_creates_trip_with_ordered_pending_stops() {
        let result = TripMaterializer::new()
            .materialize(&schedule(), &route(), [date(2024, 1, 15)], |_| Ok(false))
            .unwrap();

        assert!(result.skipped.is_empty());
        assert_eq!(result.created.len(), 1);

        let snapshot = &result.created[0];
        assert_eq!(snapshot.trip.status, TripStatus::Planned);
        assert_eq!(snapshot.trip.trip_type, TripType::Return);
        assert_eq!(snapshot.trip.planned_start, date(2024, 1, 15).and_hms_opt(15, 30, 0).unwrap());
        assert_eq!(snapshot.trip.id.as_str(), "s1@2024-01-15");

        let order: Vec<_> = snapshot.stops.iter().map(|s| s.stop_point_id.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "school"]);
        assert!(snapshot.stops.iter().all(|s| s.status == TripStopStatus::Pending));
        assert_eq!(snapshot.stops[2].direction, Direction::Dropoff);
    }

    #[test]
    fn test_existing_and_repeated_dates_are_skipped() {
        let existing = date(2024, 1, 16);
        let result = TripMaterializer::new()
            .materialize(
                &schedule(),
                &route(),
                [date(2024, 1, 15), existing, date(2024, 1, 15)],
                |d| Ok(d == existing),
            )
            .unwrap();

        assert_eq!(result.created.len(), 1);
        assert_eq!(result.skipped, vec![existing, date(2024, 1, 15)]);
    }

    #[test]
    fn test_empty_route_is_flagged() {
        let inactive_only = vec![route_stop("closed", 1, Direction::Pickup, false)];
        let err = TripMaterializer::new()
            .materialize(&schedule(), &inactive_only, [date(2024, 1, 15)], |_| Ok(false))
            .unwrap_err();
        assert!(matches!(err, DispatchError::RouteEmpty { .. }));
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
    }

    #[test]
    fn test_no_dates_needs_no_route() {
        let result = TripMaterializer::new()
            .materialize(&schedule(), &[], std::iter::empty(), |_| Ok(false))
            .unwrap();
        assert_eq!(result, Materialization::default());
    }

    #[test]
    fn test_duplicate_sequence_is_invalid() {
        let mut stops = route();
        stops.push(route_stop("C", 1, Direction::Pickup, true));
        let err = TripMaterializer::new()
            .materialize(&schedule(), &stops, [date(2024, 1, 15)], |_| Ok(false))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidData(_)));
    }

    #[test]
    fn test_lookup_failure_propagates() {
        let err = TripMaterializer::new()
            .materialize(&schedule(), &route(), [date(2024, 1, 15)], |_| {
                Err(DispatchError::Storage("connection reset".into()))
            })
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
