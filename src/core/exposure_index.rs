use crate::core::diagnostics::{MissingnessAccumulator, MissingnessDiagnostic};
use crate::core::exclusions::{ExclusionLog, ExclusionReason};
use crate::core::quality_filter::{
    FilterOutcome, QualityFilter, QualityFilterConfig, QualityStatistics, SceneRejection,
};
use crate::core::spatial_extract::{ExtractionConfig, LocationSample, SpatialExtractor};
use crate::types::{
    CalendarConfig, ExposureKey, ExposureObservation, HeatError, HeatResult, LocationId, LocationSet, Scene,
};
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-scene processing log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneRecord {
    pub scene_id: String,
    pub acquired: Option<DateTime<FixedOffset>>,
    pub usable: bool,
    pub statistics: Option<QualityStatistics>,
    pub observations: usize,
}

/// Output of filtering and extracting one scene
#[derive(Debug, Clone)]
pub enum SceneContribution {
    Extracted {
        scene_id: String,
        acquired: DateTime<FixedOffset>,
        statistics: QualityStatistics,
        samples: Vec<LocationSample>,
    },
    Rejected(SceneRejection),
    Malformed { scene_id: String, cause: String },
}

/// Run the quality filter and, for usable scenes only, the extractor
pub fn process_scene(
    scene: Scene,
    locations: &LocationSet,
    filter: &QualityFilter,
    extractor: &SpatialExtractor,
    calendar: &CalendarConfig,
) -> SceneContribution {
    let scene_id = scene.id.clone();
    match filter.apply(scene) {
        Ok(FilterOutcome::Usable(surface)) => {
            let date = surface.date(calendar);
            let samples = extractor.extract(&surface, locations, date);
            SceneContribution::Extracted {
                scene_id,
                acquired: surface.acquired(),
                statistics: *surface.statistics(),
                samples,
            }
        }
        Ok(FilterOutcome::Unusable(rejection)) => SceneContribution::Rejected(rejection),
        Err(e) => SceneContribution::Malformed {
            scene_id,
            cause: e.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WeightedValue {
    weighted_sum: f64,
    pixel_count: u32,
}

/// Single writer for the exposure index. `freeze` hands out the read-only index.
#[derive(Debug, Default)]
pub struct ExposureIndexBuilder {
    values: BTreeMap<ExposureKey, WeightedValue>,
    scenes: Vec<SceneRecord>,
    exclusions: ExclusionLog,
    missingness: MissingnessAccumulator,
}

impl ExposureIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one scene's contribution. Same-date observations for a location
    /// merge into a pixel-weighted mean.
    pub fn add_contribution(&mut self, contribution: SceneContribution) {
        match contribution {
            SceneContribution::Extracted {
                scene_id,
                acquired,
                statistics,
                samples,
            } => {
                let mut observed = 0;
                for sample in samples {
                    self.missingness.add_sample(&sample);
                    match sample.observation {
                        Some(obs) => {
                            observed += 1;
                            let entry = self.values.entry(obs.key()).or_default();
                            entry.weighted_sum += obs.value() * f64::from(obs.pixel_count());
                            entry.pixel_count += obs.pixel_count();
                        }
                        None => self.exclusions.record(ExclusionReason::NoValidPixels),
                    }
                }
                self.scenes.push(SceneRecord {
                    scene_id,
                    acquired: Some(acquired),
                    usable: true,
                    statistics: Some(statistics),
                    observations: observed,
                });
            }
            SceneContribution::Rejected(rejection) => {
                self.exclusions.record(ExclusionReason::SceneUnusable);
                self.missingness.add_unusable_scene();
                self.scenes.push(SceneRecord {
                    scene_id: rejection.scene_id,
                    acquired: Some(rejection.acquired),
                    usable: false,
                    statistics: Some(rejection.statistics),
                    observations: 0,
                });
            }
            SceneContribution::Malformed { scene_id, cause } => {
                log::warn!("Skipping malformed scene {}: {}", scene_id, cause);
                self.exclusions.record(ExclusionReason::SceneMalformed);
                self.scenes.push(SceneRecord {
                    scene_id,
                    acquired: None,
                    usable: false,
                    statistics: None,
                    observations: 0,
                });
            }
        }
    }

    /// Insert a pre-computed observation. A second observation for the same key is an error.
    pub fn insert_observation(&mut self, observation: ExposureObservation) -> HeatResult<()> {
        let key = observation.key();
        if self.values.contains_key(&key) {
            return Err(HeatError::InvalidFormat(format!(
                "duplicate exposure observation for location {} on {}",
                key.location, key.date
            )));
        }
        self.values.insert(
            key,
            WeightedValue {
                weighted_sum: observation.value() * f64::from(observation.pixel_count()),
                pixel_count: observation.pixel_count(),
            },
        );
        Ok(())
    }

    pub fn freeze(self) -> ExposureIndex {
        let observations: BTreeMap<ExposureKey, ExposureObservation> = self
            .values
            .into_iter()
            .filter_map(|(key, v)| {
                let mean = v.weighted_sum / f64::from(v.pixel_count.max(1));
                ExposureObservation::new(key.location.clone(), key.date, mean, v.pixel_count).map(|obs| (key, obs))
            })
            .collect();

        log::info!(
            "Exposure index frozen: {} observations from {} scenes",
            observations.len(),
            self.scenes.len()
        );

        ExposureIndex {
            observations,
            scenes: self.scenes,
            exclusions: self.exclusions,
            missingness: self.missingness.finish(),
        }
    }
}

/// Summary of index construction for the report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexSummary {
    pub scenes_total: usize,
    pub scenes_usable: usize,
    pub scenes_unusable: usize,
    pub observations: usize,
    pub locations_observed: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

/// Read-only (location, date) -> exposure store
#[derive(Debug, Clone, Default)]
pub struct ExposureIndex {
    observations: BTreeMap<ExposureKey, ExposureObservation>,
    scenes: Vec<SceneRecord>,
    exclusions: ExclusionLog,
    missingness: MissingnessDiagnostic,
}

impl ExposureIndex {
    /// Filter and extract every scene, then merge into a frozen index.
    ///
    /// Scenes are consumed; with the `parallel` feature they are processed
    /// concurrently and merged in input order.
    pub fn build(
        scenes: Vec<Scene>,
        locations: &LocationSet,
        quality: &QualityFilterConfig,
        extraction: &ExtractionConfig,
        calendar: &CalendarConfig,
    ) -> ExposureIndex {
        log::info!(
            "Building exposure index from {} scenes over {} locations",
            scenes.len(),
            locations.len()
        );
        let filter = QualityFilter::new(quality.clone());
        let extractor = SpatialExtractor::new(extraction.clone());

        #[cfg(feature = "parallel")]
        let contributions: Vec<SceneContribution> = {
            use rayon::prelude::*;
            scenes
                .into_par_iter()
                .map(|scene| process_scene(scene, locations, &filter, &extractor, calendar))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let contributions: Vec<SceneContribution> = scenes
            .into_iter()
            .map(|scene| process_scene(scene, locations, &filter, &extractor, calendar))
            .collect();

        let mut builder = ExposureIndexBuilder::new();
        for contribution in contributions {
            builder.add_contribution(contribution);
        }
        builder.freeze()
    }

    /// Index from pre-computed observations (e.g. a persisted exposure table)
    pub fn from_observations<I>(observations: I) -> HeatResult<ExposureIndex>
    where
        I: IntoIterator<Item = ExposureObservation>,
    {
        let mut builder = ExposureIndexBuilder::new();
        for observation in observations {
            builder.insert_observation(observation)?;
        }
        Ok(builder.freeze())
    }

    pub fn get(&self, location: &LocationId, date: NaiveDate) -> Option<&ExposureObservation> {
        self.observations.get(&ExposureKey::new(location.clone(), date))
    }

    pub fn get_key(&self, key: &ExposureKey) -> Option<&ExposureObservation> {
        self.observations.get(key)
    }

    pub fn contains(&self, key: &ExposureKey) -> bool {
        self.observations.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observations in (location, date) order
    pub fn observations(&self) -> impl Iterator<Item = &ExposureObservation> {
        self.observations.values()
    }

    pub fn scenes(&self) -> &[SceneRecord] {
        &self.scenes
    }

    pub fn exclusions(&self) -> &ExclusionLog {
        &self.exclusions
    }

    pub fn missingness(&self) -> &MissingnessDiagnostic {
        &self.missingness
    }

    pub fn summary(&self) -> IndexSummary {
        let mut locations: Vec<&LocationId> = self.observations.keys().map(|k| &k.location).collect();
        locations.dedup();
        let dates = self.observations.keys().map(|k| k.date);
        let scenes_usable = self.scenes.iter().filter(|s| s.usable).count();

        IndexSummary {
            scenes_total: self.scenes.len(),
            scenes_usable,
            scenes_unusable: self.scenes.len() - scenes_usable,
            observations: self.observations.len(),
            locations_observed: locations.len(),
            first_date: dates.clone().min(),
            last_date: dates.max(),
        }
    }
}
