use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reason code for a unit dropped from the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Scene rejected by the quality filter
    SceneUnusable,
    /// Scene bands could not be read consistently
    SceneMalformed,
    /// (scene, location) pair without a valid pixel
    NoValidPixels,
    /// Event refers to a location absent from the location set
    UnknownLocation,
    /// Event date has no exposure observation
    UnexposedOnDate,
    /// Event outside the variant's month subset
    OutsideSeason,
    /// Case record lacks a required covariate
    MissingCovariate,
    /// Control dropped from its stratum for a missing covariate
    ControlMissingCovariate,
    /// Event with zero admissible control dates
    NoAdmissibleControls,
}

/// Aggregate exclusion counts for auditability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionLog {
    counts: BTreeMap<ExclusionReason, usize>,
}

impl ExclusionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, reason: ExclusionReason) {
        self.record_many(reason, 1);
    }

    pub fn record_many(&mut self, reason: ExclusionReason, count: usize) {
        if count > 0 {
            *self.counts.entry(reason).or_insert(0) += count;
        }
    }

    pub fn count(&self, reason: ExclusionReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExclusionReason, usize)> + '_ {
        self.counts.iter().map(|(&r, &c)| (r, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_serialisation() {
        let mut log = ExclusionLog::new();
        log.record(ExclusionReason::UnexposedOnDate);
        log.record(ExclusionReason::UnexposedOnDate);
        log.record_many(ExclusionReason::NoValidPixels, 0);
        log.record_many(ExclusionReason::NoAdmissibleControls, 1);

        assert_eq!(log.count(ExclusionReason::UnexposedOnDate), 2);
        assert_eq!(log.count(ExclusionReason::NoValidPixels), 0);
        assert_eq!(log.total(), 3);

        let json = serde_json::to_string(&log).unwrap();
        assert_eq!(json, r#"{"unexposed_on_date":2,"no_admissible_controls":1}"#);
    }
}
