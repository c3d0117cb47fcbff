//! Analysis configuration, loaded from TOML and validated before any processing.

use crate::core::conditional_logit::RegressionConfig;
use crate::core::covariates::CovariateConfig;
use crate::core::quality_filter::QualityFilterConfig;
use crate::core::spatial_extract::ExtractionConfig;
use crate::core::temporal_match::{MatchingConfig, MAX_CONTROLS};
use crate::types::{CalendarConfig, HeatError, HeatResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One independently fitted model: covariate subset and optional season
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    #[serde(default)]
    pub covariates: Vec<String>,
    /// Months of the year (1-12) admitted as case months; None = all
    #[serde(default)]
    pub months: Option<Vec<u32>>,
}

impl VariantSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            covariates: Vec::new(),
            months: None,
        }
    }

    /// Exposure-only model over every month
    pub fn primary() -> Self {
        Self::new("primary")
    }

    pub fn with_covariates(mut self, covariates: &[&str]) -> Self {
        self.covariates = covariates.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_months(mut self, months: &[u32]) -> Self {
        self.months = Some(months.to_vec());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub calendar: CalendarConfig,
    pub quality: QualityFilterConfig,
    pub extraction: ExtractionConfig,
    pub matching: MatchingConfig,
    pub regression: RegressionConfig,
    pub covariates: CovariateConfig,
    pub variants: Vec<VariantSpec>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            calendar: CalendarConfig::default(),
            quality: QualityFilterConfig::default(),
            extraction: ExtractionConfig::default(),
            matching: MatchingConfig::default(),
            regression: RegressionConfig::default(),
            covariates: CovariateConfig::default(),
            variants: vec![VariantSpec::primary()],
        }
    }
}

impl AnalysisConfig {
    /// Parse and validate a TOML document; omitted sections take their defaults
    pub fn from_toml_str(text: &str) -> HeatResult<Self> {
        let config: AnalysisConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> HeatResult<Self> {
        let path = path.as_ref();
        log::debug!("Loading analysis configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> HeatResult<String> {
        toml::to_string_pretty(self).map_err(|e| HeatError::Config(e.to_string()))
    }

    pub fn validate(&self) -> HeatResult<()> {
        let fail = |msg: String| Err(HeatError::Config(msg));

        if self.calendar.day_start_hour > 23 {
            return fail(format!("calendar.day_start_hour must be 0-23, got {}", self.calendar.day_start_hour));
        }

        let q = &self.quality;
        if !q.scale_factor.is_finite() || q.scale_factor == 0.0 {
            return fail(format!("quality.scale_factor must be finite and non-zero, got {}", q.scale_factor));
        }
        if !q.add_offset.is_finite() || !q.unit_offset.is_finite() {
            return fail("quality offsets must be finite".to_string());
        }
        if !(q.valid_min < q.valid_max) {
            return fail(format!(
                "quality valid range is empty: [{}, {}]",
                q.valid_min, q.valid_max
            ));
        }
        if !(0.0..=1.0).contains(&q.max_nodata_fraction) {
            return fail(format!(
                "quality.max_nodata_fraction must be in [0, 1], got {}",
                q.max_nodata_fraction
            ));
        }

        let radius = self.extraction.default_buffer_radius;
        if !radius.is_finite() || radius < 0.0 {
            return fail(format!("extraction.default_buffer_radius must be >= 0, got {}", radius));
        }

        let m = &self.matching;
        if m.offsets_weeks.is_empty() {
            return fail("matching.offsets_weeks is empty".to_string());
        }
        if m.offsets_weeks.contains(&0) {
            return fail("matching.offsets_weeks must not contain 0 (the case date)".to_string());
        }
        if !(1..=MAX_CONTROLS).contains(&m.max_controls) {
            return fail(format!(
                "matching.max_controls must be between 1 and {}, got {}",
                MAX_CONTROLS, m.max_controls
            ));
        }

        let r = &self.regression;
        if r.min_strata == 0 {
            return fail("regression.min_strata must be at least 1".to_string());
        }
        if r.max_iterations == 0 {
            return fail("regression.max_iterations must be at least 1".to_string());
        }
        if !(r.gradient_tolerance > 0.0) || !(r.loglik_tolerance > 0.0) {
            return fail("regression tolerances must be positive".to_string());
        }
        if !(r.confidence_level > 0.0 && r.confidence_level < 1.0) {
            return fail(format!(
                "regression.confidence_level must be in (0, 1), got {}",
                r.confidence_level
            ));
        }
        if !(r.max_abs_coefficient > 0.0) {
            return fail("regression.max_abs_coefficient must be positive".to_string());
        }

        if self.variants.is_empty() {
            return fail("at least one variant is required".to_string());
        }
        let mut names = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return fail("variant with blank name".to_string());
            }
            if !names.insert(variant.name.as_str()) {
                return fail(format!("duplicate variant name '{}'", variant.name));
            }
            if let Some(months) = &variant.months {
                if months.is_empty() {
                    return fail(format!("variant '{}' has an empty month list", variant.name));
                }
                if let Some(bad) = months.iter().find(|m| !(1..=12).contains(*m)) {
                    return fail(format!("variant '{}': invalid month {}", variant.name, bad));
                }
            }
        }

        Ok(())
    }
}
