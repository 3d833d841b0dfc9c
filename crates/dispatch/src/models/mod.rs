//! Dispatch data models, types, and the repository trait.

pub mod calendar;
pub mod entities;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use calendar::{DateRange, ServiceDates, WeekdayFlags};
pub use entities::{
    AttendanceAnomaly, RouteStopPoint, Schedule, StopPoint, StudentAssignment,
    StudentAttendance, TrackingEntry, Trip, TripChangeSet, TripSnapshot, TripStop,
};
pub use traits::DispatchRepository;
pub use types::{
    AttendanceStatus, Direction, DispatchError, ErrorKind, Result, ScheduleStatus, ScheduleType,
    TripStatus, TripStopStatus, TripType,
};
