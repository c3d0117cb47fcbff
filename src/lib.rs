//! heatcross: case-crossover analysis of satellite heat exposure
//!
//! Screens land-surface-temperature scenes for cloud and quality, extracts
//! per-location exposures into a (location, date) index, matches each event
//! to same-weekday referent dates within its month, and fits conditional
//! logistic regression per stratum to estimate exposure odds ratios.

pub mod types;
pub mod config;
pub mod io;
pub mod core;
pub mod pipeline;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    CalendarConfig, Event, ExposureKey, ExposureObservation, GeoTransform, HeatError, HeatResult, Location,
    LocationId, LocationSet, Point, Scene,
};

pub use config::{AnalysisConfig, VariantSpec};
pub use pipeline::{Analysis, AnalysisOutput};
