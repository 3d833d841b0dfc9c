//! Calendar dates on which a schedule runs.

use chrono::NaiveDate;

use crate::models::calendar::{DateRange, ServiceDates};
use crate::models::entities::Schedule;
use crate::models::types::Result;

/// Turns a schedule's recurrence into concrete dates
#[derive(Clone, Copy, Debug, Default)]
pub struct CalendarRecurrenceResolver;

impl CalendarRecurrenceResolver {
    pub fn new() -> Self {
        Self
    }

    /// Dates in `range_start..=range_end` that fall inside the schedule's
    /// validity window and on one of its weekdays.
    ///
    /// Yields nothing for an inactive schedule. Returns `Err` only when the
    /// query range itself is inverted.
    pub fn resolve_dates(
        &self,
        schedule: &Schedule,
        range_start: NaiveDate,
        range_end: NaiveDate,
    ) -> Result<ServiceDates> {
        let query = DateRange::new(range_start, range_end)?;

        if !schedule.is_active() {
            return Ok(ServiceDates::empty());
        }

        let window = schedule.validity().and_then(|v| v.intersect(&query));
        Ok(ServiceDates::new(window, schedule.days_of_week))
    }

    /// Whether a single date is a service date
    pub fn runs_on(&self, schedule: &Schedule, date: NaiveDate) -> bool {
        self.resolve_dates(schedule, date, date)
            .map(|mut dates| dates.next().is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::*;
    use crate::models::calendar::WeekdayFlags;
    use crate::models::types::{ScheduleStatus, ScheduleType};
    use chrono::{NaiveTime, Weekday};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn mwf_january() -> Schedule {
        Schedule {
            id: ScheduleIdentifier::new("s1"),
            bus_id: BusIdentifier::new("bus-1"),
            driver_id: DriverIdentifier::new("drv-1"),
            route_id: RouteIdentifier::new("r1"),
            schedule_type: ScheduleType::Morning,
            days_of_week: WeekdayFlags::from_weekdays(&[Weekday::Mon, Weekday::Wed, Weekday::Fri]),
            start_time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            start_date: date(2024, 1, 1),
            end_date: date(2024, 1, 31),
            status: ScheduleStatus::Active,
        }
    }

    #[test]
    fn test_mon_wed_fri_in_january() {
        let resolver = CalendarRecurrenceResolver::new();
        let dates: Vec<u32> = resolver
            .resolve_dates(&mwf_january(), date(2024, 1, 1), date(2024, 1, 31))
            .unwrap()
            .map(|d| chrono::Datelike::day(&d))
            .collect();

        assert_eq!(
            dates,
            vec![1, 3, 5, 8, 10, 12, 15, 17, 19, 22, 24, 26, 29, 31]
        );
    }

    #[test]
    fn test_query_range_is_intersected_with_validity() {
        let resolver = CalendarRecurrenceResolver::new();
        let dates: Vec<_> = resolver
            .resolve_dates(&mwf_january(), date(2023, 12, 1), date(2024, 1, 7))
            .unwrap()
            .collect();
        assert_eq!(dates, vec![date(2024, 1, 1), date(2024, 1, 3), date(2024, 1, 5)]);

        let after: Vec<_> = resolver
            .resolve_dates(&mwf_january(), date(2024, 2, 1), date(2024, 2, 29))
            .unwrap()
            .collect();
        assert!(after.is_empty());
    }

    #[test]
    fn test_inactive_schedule_yields_nothing() {
        let schedule = Schedule {
            status: ScheduleStatus::Inactive,
            ..mwf_january()
        };
        let resolver = CalendarRecurrenceResolver::new();
        let count = resolver
            .resolve_dates(&schedule, date(2024, 1, 1), date(2024, 1, 31))
            .unwrap()
            .count();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let resolver = CalendarRecurrenceResolver::new();
        assert!(resolver
            .resolve_dates(&mwf_january(), date(2024, 1, 31), date(2024, 1, 1))
            .is_err());
    }

    #[test]
    fn test_every_resolved_date_is_valid() {
        let resolver = CalendarRecurrenceResolver::new();
        let weekday_sets: [u8; 4] = [0b0000_0001, 0b0011_1110, 0b0100_0001, WeekdayFlags::ALL];

        for bits in weekday_sets {
            let schedule = Schedule {
                days_of_week: WeekdayFlags::from_bits(bits),
                start_date: date(2024, 1, 10),
                end_date: date(2024, 3, 20),
                ..mwf_january()
            };
            let range = (date(2024, 1, 1), date(2024, 2, 29));

            let dates: Vec<_> = resolver
                .resolve_dates(&schedule, range.0, range.1)
                .unwrap()
                .collect();
            for d in &dates {
                assert!(*d >= schedule.start_date && *d <= range.1);
                assert!(schedule.days_of_week.contains(chrono::Datelike::weekday(d)));
            }

            let expected = (0..)
                .map(|n| date(2024, 1, 10) + chrono::Duration::days(n))
                .take_while(|d| *d <= range.1)
                .filter(|d| schedule.days_of_week.contains(chrono::Datelike::weekday(d)))
                .count();
            assert_eq!(dates.len(), expected);
        }
    }

    #[test]
    fn test_runs_on() {
        let resolver = CalendarRecurrenceResolver::new();
        assert!(resolver.runs_on(&mwf_january(), date(2024, 1, 15)));
        assert!(!resolver.runs_on(&mwf_january(), date(2024, 1, 16)));
        assert!(!resolver.runs_on(&mwf_january(), date(2024, 2, 5)));
    }
}
