//! Missingness-bias diagnostic.
//!
//! Cloud cover is correlated with cooler nights, so the samples that survive
//! the quality mask may not represent the nights that were masked. The
//! diagnostic contrasts the retained exposure values with the unscreened
//! values of footprints that lost every pixel to the mask.

use crate::core::spatial_extract::LocationSample;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default)]
struct MeanAccumulator {
    sum: f64,
    count: usize,
}

impl MeanAccumulator {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Accumulates retained/excluded samples while the index is built
#[derive(Debug, Clone, Default)]
pub struct MissingnessAccumulator {
    retained: MeanAccumulator,
    excluded: MeanAccumulator,
    unusable_scenes: usize,
}

impl MissingnessAccumulator {
    pub fn add_sample(&mut self, sample: &LocationSample) {
        match (&sample.observation, &sample.unscreened) {
            (Some(obs), _) => self.retained.push(obs.value()),
            (None, Some(unscreened)) => self.excluded.push(unscreened.mean),
            (None, None) => {}
        }
    }

    pub fn add_unusable_scene(&mut self) {
        self.unusable_scenes += 1;
    }

    pub fn finish(&self) -> MissingnessDiagnostic {
        let retained_mean = self.retained.mean();
        let excluded_mean = self.excluded.mean();
        MissingnessDiagnostic {
            retained_samples: self.retained.count,
            retained_mean,
            excluded_samples: self.excluded.count,
            excluded_mean,
            mean_difference: retained_mean.zip(excluded_mean).map(|(r, e)| r - e),
            unusable_scenes: self.unusable_scenes,
        }
    }
}

/// Retained vs excluded exposure comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingnessDiagnostic {
    pub retained_samples: usize,
    pub retained_mean: Option<f64>,
    /// Footprints with in-range pixels but none passing the quality mask
    pub excluded_samples: usize,
    pub excluded_mean: Option<f64>,
    /// retained_mean - excluded_mean
    pub mean_difference: Option<f64>,
    /// Whole scenes rejected; their pixels are not sampled
    pub unusable_scenes: usize,
}
