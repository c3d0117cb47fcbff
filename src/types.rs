use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Raw measurement band (e.g. LST in scaled kelvin)
pub type MeasurementBand = Array2<f32>;

/// Categorical quality band. Values are tier ranks, 0 = best.
pub type QualityBand = Array2<u8>;

/// Cloud/obstruction band. Any non-zero value marks the pixel obstructed.
pub type CloudBand = Array2<u8>;

/// Affine transform from pixel (col, row) to raster CRS coordinates,
/// in GDAL coefficient order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation terms
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    pub fn from_gdal(coefficients: [f64; 6]) -> Self {
        Self {
            top_left_x: coefficients[0],
            pixel_width: coefficients[1],
            rotation_x: coefficients[2],
            top_left_y: coefficients[3],
            rotation_y: coefficients[4],
            pixel_height: coefficients[5],
        }
    }

    /// World coordinates of a fractional pixel position
    pub fn pixel_to_world(&self, col: f64, row: f64) -> Point {
        Point {
            x: self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            y: self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        }
    }

    /// World coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> Point {
        self.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Fractional (col, row) of a world coordinate. None for a degenerate transform.
    pub fn world_to_pixel(&self, point: &Point) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let dx = point.x - self.top_left_x;
        let dy = point.y - self.top_left_y;
        let col = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let row = (dy * self.pixel_width - dx * self.rotation_y) / det;
        Some((col, row))
    }
}

/// Point in raster CRS coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Calendar day convention shared by scenes and events.
///
/// With `day_start_hour = 6`, a scene at 02:00 local on 16 July belongs
/// to the night of 15 July.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub day_start_hour: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self { day_start_hour: 0 }
    }
}

impl CalendarConfig {
    /// Local calendar date of a timestamp, honouring its own offset
    pub fn date_of(&self, timestamp: &DateTime<FixedOffset>) -> NaiveDate {
        let shifted = timestamp.naive_local() - Duration::hours(i64::from(self.day_start_hour));
        shifted.date()
    }
}

/// One satellite observation with co-registered bands
#[derive(Debug, Clone)]
pub struct Scene {
    pub id: String,
    pub acquired: DateTime<FixedOffset>,
    pub geo_transform: GeoTransform,
    pub measurement: MeasurementBand,
    pub quality: QualityBand,
    pub cloud: CloudBand,
}

impl Scene {
    pub fn dim(&self) -> (usize, usize) {
        self.measurement.dim()
    }
}

/// Stable location identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Street face or areal unit with a representative point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub point: Point,
    pub buffer_radius: Option<f64>,
}

impl Location {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: LocationId::new(id),
            point: Point::new(x, y),
            buffer_radius: None,
        }
    }

    pub fn with_buffer(mut self, radius: f64) -> Self {
        self.buffer_radius = Some(radius);
        self
    }
}

/// Validated, read-only collection of locations with unique identifiers
#[derive(Debug, Clone, Default)]
pub struct LocationSet {
    locations: Vec<Location>,
    by_id: HashMap<LocationId, usize>,
}

impl LocationSet {
    /// Fails fast on a duplicate or blank identifier
    pub fn new(locations: Vec<Location>) -> HeatResult<Self> {
        let mut by_id = HashMap::with_capacity(locations.len());
        for (i, location) in locations.iter().enumerate() {
            if location.id.as_str().trim().is_empty() {
                return Err(HeatError::InvalidFormat(format!(
                    "location at position {} has a blank identifier",
                    i
                )));
            }
            if by_id.insert(location.id.clone(), i).is_some() {
                return Err(HeatError::DuplicateLocation(location.id.clone()));
            }
        }
        log::debug!("Validated {} locations", locations.len());
        Ok(Self { locations, by_id })
    }

    pub fn get(&self, id: &LocationId) -> Option<&Location> {
        self.by_id.get(id).map(|&i| &self.locations[i])
    }

    pub fn contains(&self, id: &LocationId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.iter()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Typed join key used by the exposure index, event resolution and matching
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExposureKey {
    pub location: LocationId,
    pub date: NaiveDate,
}

impl ExposureKey {
    pub fn new(location: LocationId, date: NaiveDate) -> Self {
        Self { location, date }
    }
}

/// Exposure value for one (location, date), backed by at least one valid pixel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposureObservation {
    location: LocationId,
    date: NaiveDate,
    value: f64,
    pixel_count: u32,
}

impl ExposureObservation {
    /// None when no valid pixel backs the value or the value is not finite
    pub fn new(location: LocationId, date: NaiveDate, value: f64, pixel_count: u32) -> Option<Self> {
        if pixel_count == 0 || !value.is_finite() {
            return None;
        }
        Some(Self {
            location,
            date,
            value,
            pixel_count,
        })
    }

    pub fn location(&self) -> &LocationId {
        &self.location
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn pixel_count(&self) -> u32 {
        self.pixel_count
    }

    pub fn key(&self) -> ExposureKey {
        ExposureKey::new(self.location.clone(), self.date)
    }
}

/// Outcome occurrence already resolved to a location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<String>,
    pub timestamp: DateTime<FixedOffset>,
    pub location: LocationId,
}

impl Event {
    pub fn new(timestamp: DateTime<FixedOffset>, location: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp,
            location: LocationId::new(location),
        }
    }
}

/// Error types for the analysis pipeline
#[derive(Debug, thiserror::Error)]
pub enum HeatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate location identifier: {0}")]
    DuplicateLocation(LocationId),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Malformed timestamp '{value}': {reason}")]
    MalformedTimestamp { value: String, reason: String },

    #[error("Covariate '{name}' missing for location {location} on {date}")]
    MissingCovariate {
        name: String,
        location: LocationId,
        date: NaiveDate,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for pipeline operations
pub type HeatResult<T> = Result<T, HeatError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_duplicate_location_fails_fast() {
        let result = LocationSet::new(vec![
            Location::new("A", 0.0, 0.0),
            Location::new("B", 1.0, 1.0),
            Location::new("A", 2.0, 2.0),
        ]);
        match result {
            Err(HeatError::DuplicateLocation(id)) => assert_eq!(id.as_str(), "A"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_observation_requires_pixels() {
        let date = NaiveDate::from_ymd_opt(2023, 7, 15).unwrap();
        assert!(ExposureObservation::new("A".into(), date, 25.0, 0).is_none());
        assert!(ExposureObservation::new("A".into(), date, f64::NAN, 3).is_none());
        let obs = ExposureObservation::new("A".into(), date, 25.0, 3).unwrap();
        assert_eq!(obs.pixel_count(), 3);
    }

    #[test]
    fn test_geotransform_round_trip() {
        let gt = GeoTransform::north_up(1000.0, 2000.0, 70.0);
        let center = gt.pixel_center(2, 3);
        assert!((center.x - (1000.0 + 3.5 * 70.0)).abs() < 1e-9);
        assert!((center.y - (2000.0 - 2.5 * 70.0)).abs() < 1e-9);

        let (col, row) = gt.world_to_pixel(&center).unwrap();
        assert!((col - 3.5).abs() < 1e-9);
        assert!((row - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_calendar_day_start_shifts_night() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let ts = offset.with_ymd_and_hms(2023, 7, 16, 2, 0, 0).unwrap();

        let midnight = CalendarConfig::default();
        assert_eq!(midnight.date_of(&ts), NaiveDate::from_ymd_opt(2023, 7, 16).unwrap());

        let night = CalendarConfig { day_start_hour: 6 };
        assert_eq!(night.date_of(&ts), NaiveDate::from_ymd_opt(2023, 7, 15).unwrap());
    }
}
