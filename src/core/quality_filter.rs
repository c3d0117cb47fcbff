use crate::types::{CalendarConfig, GeoTransform, HeatError, HeatResult, Scene};
use chrono::{DateTime, FixedOffset, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Quality tiers accepted by the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPolicy {
    /// Top tier only
    Strict,
    /// Top two tiers
    Lenient,
}

impl QualityPolicy {
    pub fn accepts(self, tier: u8) -> bool {
        match self {
            QualityPolicy::Strict => tier == 0,
            QualityPolicy::Lenient => tier <= 1,
        }
    }
}

/// Quality filter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFilterConfig {
    pub policy: QualityPolicy,
    /// Multiplier applied to raw digital numbers
    pub scale_factor: f64,
    /// Offset added after scaling (still in source unit)
    pub add_offset: f64,
    /// Subtracted to reach the analysis unit (kelvin -> celsius)
    pub unit_offset: f64,
    /// Raw value marking missing data in the measurement band
    pub fill_value: Option<f32>,
    /// Physically valid range in the analysis unit
    pub valid_min: f64,
    pub valid_max: f64,
    /// Scenes with a larger no-data fraction are unusable
    pub max_nodata_fraction: f64,
}

impl Default for QualityFilterConfig {
    fn default() -> Self {
        Self {
            policy: QualityPolicy::Strict,
            scale_factor: 1.0,
            add_offset: 0.0,
            unit_offset: 273.15,
            fill_value: None,
            valid_min: -40.0,
            valid_max: 60.0,
            max_nodata_fraction: 1.0,
        }
    }
}

/// Per-scene pixel accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityStatistics {
    pub total_pixels: usize,
    pub cloud_masked: usize,
    pub quality_masked: usize,
    pub out_of_range: usize,
    pub valid_pixels: usize,
    pub nodata_fraction: f64,
}

/// Why a scene was excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnusableReason {
    /// No valid pixel survived masking
    Empty,
    /// No-data fraction above the configured threshold
    ExceedsNoDataThreshold,
}

/// Scene reported unusable by the quality filter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneRejection {
    pub scene_id: String,
    pub acquired: DateTime<FixedOffset>,
    pub reason: UnusableReason,
    pub statistics: QualityStatistics,
}

/// Masked, unit-corrected measurement surface.
///
/// Values are only reachable through `Option` accessors, so masked pixels
/// cannot take part in arithmetic.
#[derive(Debug, Clone)]
pub struct MaskedSurface {
    scene_id: String,
    acquired: DateTime<FixedOffset>,
    geo_transform: GeoTransform,
    values: Array2<f32>,
    valid: Array2<bool>,
    in_range: Array2<bool>,
    statistics: QualityStatistics,
}

impl MaskedSurface {
    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    pub fn acquired(&self) -> DateTime<FixedOffset> {
        self.acquired
    }

    pub fn date(&self, calendar: &CalendarConfig) -> NaiveDate {
        calendar.date_of(&self.acquired)
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        &self.geo_transform
    }

    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn statistics(&self) -> &QualityStatistics {
        &self.statistics
    }

    /// Screened value: None for cloud, rejected quality tier, or out of range
    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        match self.valid.get((row, col)) {
            Some(true) => Some(self.values[[row, col]]),
            _ => None,
        }
    }

    /// Converted value ignoring cloud and quality masks; still None when out of range
    pub fn unscreened_value(&self, row: usize, col: usize) -> Option<f32> {
        match self.in_range.get((row, col)) {
            Some(true) => Some(self.values[[row, col]]),
            _ => None,
        }
    }
}

/// Result of filtering one scene
#[derive(Debug, Clone)]
pub enum FilterOutcome {
    Usable(MaskedSurface),
    Unusable(SceneRejection),
}

/// Quality filter processor
pub struct QualityFilter {
    config: QualityFilterConfig,
}

impl QualityFilter {
    pub fn new(config: QualityFilterConfig) -> Self {
        Self { config }
    }

    /// Create a quality filter with default (strict) parameters
    pub fn standard() -> Self {
        Self::new(QualityFilterConfig::default())
    }

    pub fn config(&self) -> &QualityFilterConfig {
        &self.config
    }

    /// Convert a raw measurement to the analysis unit, None when invalid
    pub fn convert(&self, raw: f32) -> Option<f32> {
        if !raw.is_finite() || self.config.fill_value == Some(raw) {
            return None;
        }
        let converted = f64::from(raw) * self.config.scale_factor + self.config.add_offset - self.config.unit_offset;
        if converted < self.config.valid_min || converted > self.config.valid_max {
            return None;
        }
        Some(converted as f32)
    }

    /// Mask and convert a scene. The scene is consumed.
    ///
    /// Mismatched band shapes are an error; an unusable scene is a normal outcome.
    pub fn apply(&self, scene: Scene) -> HeatResult<FilterOutcome> {
        let dim = scene.measurement.dim();
        if scene.quality.dim() != dim || scene.cloud.dim() != dim {
            return Err(HeatError::InvalidFormat(format!(
                "scene {}: band shapes differ (measurement {:?}, quality {:?}, cloud {:?})",
                scene.id,
                dim,
                scene.quality.dim(),
                scene.cloud.dim()
            )));
        }

        let (rows, cols) = dim;
        let mut statistics = QualityStatistics {
            total_pixels: rows * cols,
            ..Default::default()
        };
        let mut values = Array2::<f32>::zeros(dim);
        let mut valid = Array2::from_elem(dim, false);
        let mut in_range = Array2::from_elem(dim, false);

        for ((row, col), &raw) in scene.measurement.indexed_iter() {
            let converted = self.convert(raw);
            if let Some(value) = converted {
                values[[row, col]] = value;
                in_range[[row, col]] = true;
            }

            if scene.cloud[[row, col]] != 0 {
                statistics.cloud_masked += 1;
            } else if !self.config.policy.accepts(scene.quality[[row, col]]) {
                statistics.quality_masked += 1;
            } else if converted.is_none() {
                statistics.out_of_range += 1;
            } else {
                valid[[row, col]] = true;
                statistics.valid_pixels += 1;
            }
        }

        statistics.nodata_fraction = if statistics.total_pixels == 0 {
            1.0
        } else {
            1.0 - statistics.valid_pixels as f64 / statistics.total_pixels as f64
        };

        let reason = if statistics.valid_pixels == 0 {
            Some(UnusableReason::Empty)
        } else if statistics.nodata_fraction > self.config.max_nodata_fraction {
            Some(UnusableReason::ExceedsNoDataThreshold)
        } else {
            None
        };

        if let Some(reason) = reason {
            log::debug!(
                "Scene {} unusable ({:?}): {:.1}% no data",
                scene.id,
                reason,
                statistics.nodata_fraction * 100.0
            );
            return Ok(FilterOutcome::Unusable(SceneRejection {
                scene_id: scene.id,
                acquired: scene.acquired,
                reason,
                statistics,
            }));
        }

        log::debug!(
            "Scene {}: {} of {} pixels valid (cloud {}, quality {}, range {})",
            scene.id,
            statistics.valid_pixels,
            statistics.total_pixels,
            statistics.cloud_masked,
            statistics.quality_masked,
            statistics.out_of_range
        );

        Ok(FilterOutcome::Usable(MaskedSurface {
            scene_id: scene.id,
            acquired: scene.acquired,
            geo_transform: scene.geo_transform,
            values,
            valid,
            in_range,
            statistics,
        }))
    }
}
