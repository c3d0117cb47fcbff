//! End-to-end orchestration: index, match, fit and report each variant.

use crate::config::{AnalysisConfig, VariantSpec};
use crate::core::conditional_logit::ConditionalLogit;
use crate::core::covariates::CovariateTable;
use crate::core::exposure_index::ExposureIndex;
use crate::core::report::{AnalysisReport, ResultReporter, VariantReport};
use crate::core::temporal_match::{StratumTable, TemporalMatcher};
use crate::types::{Event, HeatResult, LocationSet, Scene};

/// Stratum table built for one variant
#[derive(Debug, Clone)]
pub struct VariantTable {
    pub name: String,
    pub table: StratumTable,
}

#[derive(Debug)]
pub struct AnalysisOutput {
    pub index: ExposureIndex,
    /// Tables for variants that got as far as matching, in variant order
    pub tables: Vec<VariantTable>,
    pub report: AnalysisReport,
}

impl AnalysisOutput {
    pub fn table(&self, name: &str) -> Option<&StratumTable> {
        self.tables.iter().find(|t| t.name == name).map(|t| &t.table)
    }
}

/// Inputs shared read-only by every variant
struct VariantInputs<'a> {
    index: &'a ExposureIndex,
    locations: &'a LocationSet,
    events: &'a [Event],
    covariates: Option<&'a CovariateTable>,
}

/// Validated analysis run
pub struct Analysis {
    config: AnalysisConfig,
}

impl Analysis {
    pub fn new(config: AnalysisConfig) -> HeatResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn build_index(&self, scenes: Vec<Scene>, locations: &LocationSet) -> ExposureIndex {
        ExposureIndex::build(
            scenes,
            locations,
            &self.config.quality,
            &self.config.extraction,
            &self.config.calendar,
        )
    }

    /// Scenes through to report
    pub fn run(
        &self,
        scenes: Vec<Scene>,
        locations: &LocationSet,
        events: &[Event],
        covariates: Option<&CovariateTable>,
    ) -> HeatResult<AnalysisOutput> {
        let index = self.build_index(scenes, locations);
        self.run_with_index(index, locations, events, covariates)
    }

    /// Match and fit every variant over a frozen index
    pub fn run_with_index(
        &self,
        index: ExposureIndex,
        locations: &LocationSet,
        events: &[Event],
        covariates: Option<&CovariateTable>,
    ) -> HeatResult<AnalysisOutput> {
        log::info!(
            "Running {} variant(s) over {} events and {} exposure observations",
            self.config.variants.len(),
            events.len(),
            index.len()
        );

        let inputs = VariantInputs {
            index: &index,
            locations,
            events,
            covariates,
        };

        #[cfg(feature = "parallel")]
        let runs: Vec<(Option<StratumTable>, VariantReport)> = {
            use rayon::prelude::*;
            self.config
                .variants
                .par_iter()
                .map(|spec| self.run_variant(spec, &inputs))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let runs: Vec<(Option<StratumTable>, VariantReport)> = self
            .config
            .variants
            .iter()
            .map(|spec| self.run_variant(spec, &inputs))
            .collect();

        let mut tables = Vec::new();
        let mut variants = Vec::with_capacity(runs.len());
        for (table, report) in runs {
            if let Some(table) = table {
                tables.push(VariantTable {
                    name: report.name.clone(),
                    table,
                });
            }
            variants.push(report);
        }

        let report = ResultReporter::analysis(&index, variants);
        Ok(AnalysisOutput { index, tables, report })
    }

    /// Stratum table for one variant
    pub fn match_variant(
        &self,
        spec: &VariantSpec,
        index: &ExposureIndex,
        locations: &LocationSet,
        events: &[Event],
        covariates: Option<&CovariateTable>,
    ) -> HeatResult<StratumTable> {
        TemporalMatcher::new(index, &self.config.matching)
            .with_calendar(self.config.calendar)
            .with_covariates(covariates, spec.covariates.clone(), self.config.covariates.missing)?
            .with_months(spec.months.clone())
            .build(events, locations)
    }

    fn run_variant(&self, spec: &VariantSpec, inputs: &VariantInputs<'_>) -> (Option<StratumTable>, VariantReport) {
        log::debug!("Variant '{}': covariates {:?}, months {:?}", spec.name, spec.covariates, spec.months);

        if inputs.locations.is_empty() {
            return (None, ResultReporter::failed(spec, None, "no locations supplied"));
        }
        if inputs.events.is_empty() {
            return (None, ResultReporter::failed(spec, None, "no events supplied"));
        }

        let table = match self.match_variant(spec, inputs.index, inputs.locations, inputs.events, inputs.covariates) {
            Ok(table) => table,
            Err(e) => {
                log::warn!("Variant '{}' failed during matching: {}", spec.name, e);
                return (None, ResultReporter::failed(spec, None, e));
            }
        };

        if table.is_empty() {
            log::warn!("Variant '{}' has no valid strata", spec.name);
            let report = ResultReporter::failed(spec, Some(&table), "no valid strata");
            return (Some(table), report);
        }

        let engine = ConditionalLogit::new(self.config.regression.clone());
        let report = match engine.fit_table(&table) {
            Ok(result) => ResultReporter::variant(spec, &table, &result),
            Err(e) => {
                log::warn!("Variant '{}' not fitted: {}", spec.name, e);
                ResultReporter::failed(spec, Some(&table), e)
            }
        };
        (Some(table), report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::VariantOutcome;
    use crate::types::{ExposureObservation, Location, LocationId};
    use chrono::{FixedOffset, NaiveDate, TimeZone};

    fn event(day: u32) -> Event {
        Event::new(
            FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2023, 7, day, 14, 0, 0)
                .unwrap(),
            "A",
        )
    }

    fn index(values: &[(u32, f64)]) -> ExposureIndex {
        ExposureIndex::from_observations(values.iter().map(|&(day, value)| {
            ExposureObservation::new(
                LocationId::new("A"),
                NaiveDate::from_ymd_opt(2023, 7, day).unwrap(),
                value,
                4,
            )
            .unwrap()
        }))
        .unwrap()
    }

    #[test]
    fn test_empty_events_fail_variant_only() {
        let analysis = Analysis::new(AnalysisConfig::default()).unwrap();
        let locations = LocationSet::new(vec![Location::new("A", 0.0, 0.0)]).unwrap();
        let output = analysis.run_with_index(index(&[]), &locations, &[], None).unwrap();

        let primary = output.report.variant("primary").unwrap();
        assert_eq!(
            primary.outcome,
            VariantOutcome::Failed {
                cause: "no events supplied".to_string()
            }
        );
        assert!(output.tables.is_empty());
    }

    #[test]
    fn test_underpowered_variant_keeps_its_table() {
        let analysis = Analysis::new(AnalysisConfig::default()).unwrap();
        let locations = LocationSet::new(vec![Location::new("A", 0.0, 0.0)]).unwrap();
        // 15 July with referents 8 and 22 July; 18 July with referent 11 July
        let idx = index(&[(8, 24.0), (11, 22.0), (15, 30.0), (18, 29.0), (22, 23.0)]);
        let output = analysis
            .run_with_index(idx, &locations, &[event(15), event(18)], None)
            .unwrap();

        let table = output.table("primary").unwrap();
        assert_eq!(table.len(), 2);
        match &output.report.variants[0].outcome {
            VariantOutcome::Failed { cause } => assert!(cause.contains("underpowered")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_unknown_covariate_fails_variant() {
        let mut config = AnalysisConfig::default();
        config.variants.push(VariantSpec::new("humid").with_covariates(&["humidity"]));
        let analysis = Analysis::new(config).unwrap();
        let locations = LocationSet::new(vec![Location::new("A", 0.0, 0.0)]).unwrap();
        let output = analysis
            .run_with_index(index(&[(15, 30.0)]), &locations, &[event(15)], None)
            .unwrap();

        assert_eq!(output.report.variants.len(), 2);
        assert!(matches!(
            output.report.variant("humid").unwrap().outcome,
            VariantOutcome::Failed { .. }
        ));
        assert!(output.table("humid").is_none());
    }
}
