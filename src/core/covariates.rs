use crate::types::{ExposureKey, HeatError, HeatResult, LocationId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do when a stratum member lacks a covariate value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingCovariatePolicy {
    /// Drop the member (a case without its covariates drops the event)
    DropMember,
    /// Abort the whole variant
    DropVariant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovariateConfig {
    pub missing: MissingCovariatePolicy,
}

impl Default for CovariateConfig {
    fn default() -> Self {
        Self {
            missing: MissingCovariatePolicy::DropMember,
        }
    }
}

/// One auxiliary regressor, keyed by date and/or (location, date)
#[derive(Debug, Clone, Default)]
pub struct CovariateSeries {
    by_date: BTreeMap<NaiveDate, f64>,
    by_location_date: BTreeMap<ExposureKey, f64>,
}

impl CovariateSeries {
    /// A location-specific value takes precedence over a city-wide one
    pub fn lookup(&self, key: &ExposureKey) -> Option<f64> {
        self.by_location_date
            .get(key)
            .or_else(|| self.by_date.get(&key.date))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.by_date.len() + self.by_location_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Named covariate series supplied by external collaborators
#[derive(Debug, Clone, Default)]
pub struct CovariateTable {
    series: BTreeMap<String, CovariateSeries>,
}

impl CovariateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_date(&mut self, name: &str, date: NaiveDate, value: f64) -> HeatResult<()> {
        Self::check_value(name, value)?;
        let series = self.series.entry(name.to_string()).or_default();
        if series.by_date.insert(date, value).is_some() {
            return Err(HeatError::InvalidFormat(format!(
                "covariate '{}' has two values for {}",
                name, date
            )));
        }
        Ok(())
    }

    pub fn insert_location_date(&mut self, name: &str, location: LocationId, date: NaiveDate, value: f64) -> HeatResult<()> {
        Self::check_value(name, value)?;
        let series = self.series.entry(name.to_string()).or_default();
        let key = ExposureKey::new(location, date);
        if series.by_location_date.contains_key(&key) {
            return Err(HeatError::InvalidFormat(format!(
                "covariate '{}' has two values for location {} on {}",
                name, key.location, date
            )));
        }
        series.by_location_date.insert(key, value);
        Ok(())
    }

    fn check_value(name: &str, value: f64) -> HeatResult<()> {
        if name.trim().is_empty() {
            return Err(HeatError::InvalidFormat("covariate with blank name".to_string()));
        }
        if !value.is_finite() {
            return Err(HeatError::InvalidFormat(format!(
                "covariate '{}' has a non-finite value; leave the row out to mark it missing",
                name
            )));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    pub fn lookup(&self, name: &str, key: &ExposureKey) -> Option<f64> {
        self.series.get(name).and_then(|s| s.lookup(key))
    }

    /// Values of `names` for a key, or the first missing name
    pub fn lookup_all<'n>(&self, names: &'n [String], key: &ExposureKey) -> Result<Vec<f64>, &'n str> {
        names
            .iter()
            .map(|name| self.lookup(name, key).ok_or(name.as_str()))
            .collect()
    }
}
