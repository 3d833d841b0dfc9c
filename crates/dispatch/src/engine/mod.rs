//! Dispatch engine: pure planners plus the repository-backed service.

pub mod attendance;
pub mod clock;
pub mod config;
pub mod materializer;
pub mod resolver;
pub mod service;
pub mod state_machine;

pub use attendance::{check_assignment_overlaps, AttendanceReconciler};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use materializer::{Materialization, TripMaterializer};
pub use resolver::CalendarRecurrenceResolver;
pub use service::{DispatchService, IngestReport, LocationUpdate, MaterializationReport, StopProximity};
pub use state_machine::{Roster, TripStateMachine};
