//! photonpix-tpx: Timepix3 detector specifics.
//!
//! # Key Components
//!
//! - [`CalibrationTable`] - per-pixel ToT to energy calibration with an
//!   optional parallel-built lookup table
//! - [`DetectorConfig`] - chipboard metadata loaded from JSON
//! - [`DetectorGeometry`] / [`BoundingBox`] - pixel to detector mapping

pub mod calibration;
pub mod detector;
pub mod error;

pub use calibration::{CalibrationTable, EnergyEstimate, COEFFICIENT_BYTES};
pub use detector::{BoundingBox, DetectorConfig, DetectorGeometry};
pub use error::{Error, Result};

/// Tick and wall-clock conversions for the 640 MHz detector clock.
pub mod timing {
    pub use photonpix_core::hit::{
        seconds_from_ticks, ticks_from_nanoseconds, ticks_from_seconds, SECONDS_PER_TICK,
        TICKS_PER_NANOSECOND,
    };
}
