//! Core analysis stages

pub mod quality_filter;
pub mod spatial_extract;
pub mod diagnostics;
pub mod exclusions;
pub mod exposure_index;
pub mod covariates;
pub mod temporal_match;
pub mod linalg;
pub mod conditional_logit;
pub mod report;

// Re-export main types
pub use quality_filter::{FilterOutcome, MaskedSurface, QualityFilter, QualityFilterConfig, QualityPolicy, QualityStatistics};
pub use spatial_extract::{ExtractionConfig, LocationSample, SamplingMode, SpatialExtractor};
pub use diagnostics::MissingnessDiagnostic;
pub use exclusions::{ExclusionLog, ExclusionReason};
pub use exposure_index::{ExposureIndex, ExposureIndexBuilder, IndexSummary, SceneRecord};
pub use covariates::{CovariateConfig, CovariateTable, MissingCovariatePolicy};
pub use temporal_match::{
    CaseDateReuse, MatchWindow, MatchedStratum, MatchingConfig, Role, MAX_CONTROLS, StratumRecord, StratumTable,
    StratumTableBuilder, TemporalMatcher,
};
pub use conditional_logit::{ConditionalLogit, Estimate, FitError, FitStatus, ModelResult, RegressionConfig};
pub use report::{AnalysisReport, ResultReporter, VariantOutcome, VariantReport};
