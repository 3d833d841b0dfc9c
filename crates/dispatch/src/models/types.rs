//! Core enums and errors for dispatch data.
//!
//! Enum wire names follow the stored vocabulary (`PLANNED`, `PICKED_UP`, ...).

use chrono::NaiveDate;
use std::fmt;

use crate::identifiers::*;

// ============================================================================
// Enums
// ============================================================================

/// Time-of-day slot of a schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ScheduleType {
    Morning,
    Afternoon,
}

impl ScheduleType {
    /// Morning runs carry students to school, afternoon runs bring them back
    pub fn trip_type(self) -> TripType {
        match self {
            Self::Morning => TripType::Dispatch,
            Self::Afternoon => TripType::Return,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ScheduleStatus {
    Active,
    Inactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TripType {
    Dispatch,
    Return,
}

/// Trip lifecycle. `Completed` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TripStatus {
    Planned,
    Ongoing,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "PLANNED",
            Self::Ongoing => "ONGOING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Visit lifecycle. `Done` and `Skipped` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TripStopStatus {
    Pending,
    Arrived,
    Done,
    Skipped,
}

impl TripStopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Arrived => "ARRIVED",
            Self::Done => "DONE",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

/// Whether a stop is where students board or leave the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Direction {
    Pickup,
    Dropoff,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pickup => "PICKUP",
            Self::Dropoff => "DROPOFF",
        }
    }
}

/// Attendance only moves forward: PENDING -> PICKED_UP -> DROPPED_OFF, or
/// straight to MISSED from PENDING.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum AttendanceStatus {
    Pending,
    PickedUp,
    DroppedOff,
    Missed,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PickedUp => "PICKED_UP",
            Self::DroppedOff => "DROPPED_OFF",
            Self::Missed => "MISSED",
        }
    }

    pub fn can_advance_to(self, next: AttendanceStatus) -> bool {
        use AttendanceStatus::*;
        matches!(
            (self, next),
            (Pending, PickedUp) | (Pending, DroppedOff) | (Pending, Missed) | (PickedUp, DroppedOff)
        )
    }
}

macro_rules! impl_display_as_str {
    ($($name:ident),*) => {
        $(
            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

impl_display_as_str!(TripStatus, TripStopStatus, Direction, AttendanceStatus);

// ============================================================================
// Errors
// ============================================================================

/// Broad class of a failure, deciding who has to act on it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream configuration is broken; surface to operators.
    DataIntegrity,
    /// The caller asked for something the rules forbid.
    BusinessRule,
    /// Someone else wrote the trip first; retry from fresh state.
    Concurrency,
    /// The storage layer failed.
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Route {route_id} of schedule {schedule_id} has no stop points")]
    RouteEmpty {
        schedule_id: ScheduleIdentifier,
        route_id: RouteIdentifier,
    },

    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Stop {stop_id} on trip {trip_id} reported out of sequence (next pending: {})",
        .expected.as_ref().map(|s| s.as_str()).unwrap_or("none"))]
    OutOfSequence {
        trip_id: TripIdentifier,
        stop_id: StopPointIdentifier,
        expected: Option<StopPointIdentifier>,
    },

    #[error("Trip {trip_id} still has {} unfinished stop(s)", .unfinished.len())]
    IncompleteTrip {
        trip_id: TripIdentifier,
        unfinished: Vec<TripStopIdentifier>,
    },

    #[error("Trip {trip_id} was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        trip_id: TripIdentifier,
        expected: u64,
        found: u64,
    },

    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Stop {stop_id} is not part of trip {trip_id}")]
    StopNotOnTrip {
        trip_id: TripIdentifier,
        stop_id: StopPointIdentifier,
    },

    #[error("Student {student_id} is not assigned to trip {trip_id}")]
    StudentNotOnTrip {
        trip_id: TripIdentifier,
        student_id: StudentIdentifier,
    },

    #[error("Trip not found: {0}")]
    TripNotFound(TripIdentifier),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(ScheduleIdentifier),

    #[error("Trip for schedule {schedule_id} on {date} already exists")]
    DuplicateTrip {
        schedule_id: ScheduleIdentifier,
        date: NaiveDate,
    },

    #[error("Assignments {first} and {second} of student {student_id} overlap for {direction}")]
    OverlappingAssignment {
        student_id: StudentIdentifier,
        direction: Direction,
        first: AssignmentIdentifier,
        second: AssignmentIdentifier,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RouteEmpty { .. }
            | Self::OverlappingAssignment { .. }
            | Self::DuplicateTrip { .. }
            | Self::InvalidData(_)
            | Self::Config(_) => ErrorKind::DataIntegrity,
            Self::ConcurrentModification { .. } => ErrorKind::Concurrency,
            Self::Storage(_) => ErrorKind::Storage,
            _ => ErrorKind::BusinessRule,
        }
    }

    /// Only races and storage hiccups are worth retrying; everything else
    /// would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrency | ErrorKind::Storage)
    }

    pub(crate) fn invalid_transition(
        subject: impl fmt::Display,
        from: &'static str,
        to: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            subject: subject.to_string(),
            from,
            to,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
