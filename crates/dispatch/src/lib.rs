//! # busline-dispatch
//!
//! Trip dispatch and attendance reconciliation for school-bus operations.
//!
//! ## Features
//!
//! - **Recurrence**: Resolve weekly schedules into concrete service dates
//! - **Materialization**: Idempotent creation of trips and their stop visits
//! - **Lifecycle**: Strict trip and stop state machine with in-order arrivals
//! - **Attendance**: Reconcile stop arrivals against student assignments
//! - **Tracking**: Location pings, next-stop proximity and encoded paths
//!
//! The engine types are pure: they read a `TripSnapshot` and return a
//! `TripChangeSet`. `DispatchService` runs them against any
//! `DispatchRepository` and applies each change set atomically.
//!
//! ## Example
//!
//! ```
//! use busline_dispatch::prelude::*;
//! use chrono::{NaiveDate, NaiveTime, Weekday};
//! use geo::Point;
//!
//! let repo = InMemoryRepository::new();
//! repo.add_stop_point(StopPoint {
//!     id: StopPointIdentifier::new("gate"),
//!     name: "School gate".into(),
//!     location: Point::new(106.70, 10.77),
//! });
//! repo.add_route_stop(RouteStopPoint {
//!     route_id: RouteIdentifier::new("r1"),
//!     stop_point_id: StopPointIdentifier::new("gate"),
//!     sequence: 1,
//!     direction: Direction::Dropoff,
//!     active: true,
//! });
//! repo.add_schedule(Schedule {
//!     id: ScheduleIdentifier::new("s1"),
//!     bus_id: BusIdentifier::new("bus-1"),
//!     driver_id: DriverIdentifier::new("drv-1"),
//!     route_id: RouteIdentifier::new("r1"),
//!     schedule_type: ScheduleType::Morning,
//!     days_of_week: WeekdayFlags::from_weekdays(&[Weekday::Mon, Weekday::Wed, Weekday::Fri]),
//!     start_time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
//!     start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!     end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
//!     status: ScheduleStatus::Active,
//! });
//!
//! let now = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(7, 0, 0).unwrap();
//! let service = DispatchService::new(repo, FixedClock(now), EngineConfig::default()).unwrap();
//!
//! let report = service
//!     .materialize_all(
//!         NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!         NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
//!     )
//!     .unwrap();
//! assert_eq!(report.created.len(), 14);
//! ```

pub mod engine;
pub mod identifiers;
pub mod ingest;
pub mod models;
pub mod provider;
pub mod spatial;

// Re-exports for convenience
pub mod prelude {
    pub use crate::engine::{
        check_assignment_overlaps, AttendanceReconciler, CalendarRecurrenceResolver, Clock,
        DispatchService, EngineConfig, FixedClock, IngestReport, LocationUpdate, Materialization,
        MaterializationReport, Roster, StopProximity, SystemClock, TripMaterializer,
        TripStateMachine,
    };
    pub use crate::identifiers::*;
    pub use crate::ingest::{LocationEvent, LocationSource};
    pub use crate::models::{calendar::*, entities::*, traits::*, types::*};
    pub use crate::provider::InMemoryRepository;
}

pub use prelude::*;
