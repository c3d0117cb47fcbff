use crate::core::quality_filter::MaskedSurface;
use crate::types::{ExposureObservation, Location, LocationId, LocationSet};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How a location's footprint is sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Pixel containing the representative point
    Point,
    /// Pixels whose centres lie within the buffer radius
    Buffer,
}

/// Spatial extraction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub mode: SamplingMode,
    /// Radius used when a location carries no buffer of its own (raster CRS units)
    pub default_buffer_radius: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Buffer,
            default_buffer_radius: 100.0,
        }
    }
}

/// Mean of the in-range pixels of a footprint, ignoring cloud and quality masks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnscreenedSample {
    pub mean: f64,
    pub pixel_count: u32,
}

/// Extraction result for one (scene, location) pair
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub location: LocationId,
    pub observation: Option<ExposureObservation>,
    pub unscreened: Option<UnscreenedSample>,
}

#[derive(Default)]
struct RunningMean {
    sum: f64,
    count: u32,
}

impl RunningMean {
    fn push(&mut self, value: f32) {
        self.sum += f64::from(value);
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / f64::from(self.count))
    }
}

/// Reduces a masked surface to per-location exposure values
pub struct SpatialExtractor {
    config: ExtractionConfig,
}

impl SpatialExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Sample every location. Locations outside the raster, or without
    /// valid pixels, yield a sample with no observation.
    pub fn extract(&self, surface: &MaskedSurface, locations: &LocationSet, date: NaiveDate) -> Vec<LocationSample> {
        let samples: Vec<LocationSample> = locations
            .iter()
            .map(|location| self.sample_location(surface, location, date))
            .collect();

        log::debug!(
            "Scene {}: {} of {} locations observed",
            surface.scene_id(),
            samples.iter().filter(|s| s.observation.is_some()).count(),
            samples.len()
        );
        samples
    }

    pub fn sample_location(&self, surface: &MaskedSurface, location: &Location, date: NaiveDate) -> LocationSample {
        let pixels = self.footprint_pixels(surface, location);

        let mut screened = RunningMean::default();
        let mut unscreened = RunningMean::default();
        for &(row, col) in &pixels {
            if let Some(value) = surface.value(row, col) {
                screened.push(value);
            }
            if let Some(value) = surface.unscreened_value(row, col) {
                unscreened.push(value);
            }
        }

        let observation = screened
            .mean()
            .and_then(|mean| ExposureObservation::new(location.id.clone(), date, mean, screened.count));

        LocationSample {
            location: location.id.clone(),
            observation,
            unscreened: unscreened.mean().map(|mean| UnscreenedSample {
                mean,
                pixel_count: unscreened.count,
            }),
        }
    }

    /// Pixel indices (row, col) of a location's sampling footprint
    fn footprint_pixels(&self, surface: &MaskedSurface, location: &Location) -> Vec<(usize, usize)> {
        let (rows, cols) = surface.dim();
        let transform = surface.geo_transform();
        let Some((col_f, row_f)) = transform.world_to_pixel(&location.point) else {
            return Vec::new();
        };

        let containing = if col_f >= 0.0 && row_f >= 0.0 && (col_f as usize) < cols && (row_f as usize) < rows {
            Some((row_f as usize, col_f as usize))
        } else {
            None
        };

        match self.config.mode {
            SamplingMode::Point => containing.into_iter().collect(),
            SamplingMode::Buffer => {
                let radius = location.buffer_radius.unwrap_or(self.config.default_buffer_radius);
                let mut pixels = Vec::new();

                // Pixel window bounding the buffer circle
                let pixel_size = transform
                    .pixel_width
                    .abs()
                    .min(transform.pixel_height.abs())
                    .max(f64::EPSILON);
                let reach = (radius / pixel_size).ceil() + 1.0;
                let row_lo = (row_f - reach).floor().max(0.0) as usize;
                let col_lo = (col_f - reach).floor().max(0.0) as usize;
                let row_hi = (row_f + reach).ceil().min(rows as f64).max(0.0) as usize;
                let col_hi = (col_f + reach).ceil().min(cols as f64).max(0.0) as usize;

                for row in row_lo..row_hi {
                    for col in col_lo..col_hi {
                        let center = transform.pixel_center(row, col);
                        if center.distance(&location.point) <= radius || containing == Some((row, col)) {
                            pixels.push((row, col));
                        }
                    }
                }
                pixels
            }
        }
    }
}
