//! Type-safe, efficient identifiers for dispatch entities.
//!
//! All identifiers use Arc<str> for cheap cloning and minimal memory overhead.
//! Materialized rows get deterministic identifiers derived from their natural
//! keys, so the same (schedule, date) can never mint two trip identities.

use chrono::NaiveDate;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

macro_rules! impl_identifier {
    ($name:ident) => {
        #[derive(Clone, Debug)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl AsRef<str>) -> Self {
                Self(s.as_ref().into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

impl_identifier!(ScheduleIdentifier);
impl_identifier!(RouteIdentifier);
impl_identifier!(StopPointIdentifier);
impl_identifier!(TripIdentifier);
impl_identifier!(TripStopIdentifier);
impl_identifier!(StudentIdentifier);
impl_identifier!(BusIdentifier);
impl_identifier!(DriverIdentifier);
impl_identifier!(AssignmentIdentifier);

impl TripIdentifier {
    /// Identifier of the trip materialized for `schedule` on `date`
    pub fn for_schedule(schedule: &ScheduleIdentifier, date: NaiveDate) -> Self {
        Self::new(format!("{}@{}", schedule, date.format("%Y-%m-%d")))
    }
}

impl TripStopIdentifier {
    /// Identifier of the `sequence`-th visit of `trip`
    pub fn for_visit(trip: &TripIdentifier, sequence: u32) -> Self {
        Self::new(format!("{}#{}", trip, sequence))
    }
}
