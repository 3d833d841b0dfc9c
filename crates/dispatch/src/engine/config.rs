//! Engine configuration.
//!
//! All fields have defaults, so a config file only needs to name what it
//! changes.

use crate::models::types::{DispatchError, Result};

/// Default proximity at which a bus counts as being at a stop
pub const DEFAULT_ARRIVAL_RADIUS_M: f64 = 50.0;

/// Default number of days materialized ahead by a batch run
pub const DEFAULT_HORIZON_DAYS: u32 = 14;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Arrival at a pickup stop marks the assigned students picked up.
    /// When off, arrival only opens PENDING records for the driver to mark.
    pub auto_pickup_on_arrival: bool,

    /// Same as `auto_pickup_on_arrival`, for dropoff stops.
    pub auto_dropoff_on_arrival: bool,

    /// Meters within which a location update reports the next stop as reached
    pub arrival_radius_m: f64,

    /// Days covered by `materialize_horizon`, starting today
    pub materialization_horizon_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_pickup_on_arrival: true,
            auto_dropoff_on_arrival: true,
            arrival_radius_m: DEFAULT_ARRIVAL_RADIUS_M,
            materialization_horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.arrival_radius_m.is_finite() || self.arrival_radius_m <= 0.0 {
            return Err(DispatchError::Config(format!(
                "arrival_radius_m must be a positive number of meters, got {}",
                self.arrival_radius_m
            )));
        }
        if self.materialization_horizon_days == 0 {
            return Err(DispatchError::Config(
                "materialization_horizon_days must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON config document
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
