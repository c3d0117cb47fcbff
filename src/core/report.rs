//! Formatting of fits and run diagnostics into a serialisable report.

use crate::config::VariantSpec;
use crate::core::conditional_logit::{Estimate, FitStatus, ModelResult};
use crate::core::diagnostics::MissingnessDiagnostic;
use crate::core::exclusions::ExclusionLog;
use crate::core::exposure_index::{ExposureIndex, IndexSummary};
use crate::core::temporal_match::StratumTable;
use crate::types::HeatResult;
use serde::Serialize;
use std::fmt::Write as _;

/// Final state of one variant
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VariantOutcome {
    Fitted {
        iterations: usize,
        log_likelihood: f64,
        likelihood_ratio: f64,
        confidence_level: f64,
        uncertainty_available: bool,
        separation_suspected: bool,
        estimates: Vec<Estimate>,
    },
    /// The optimizer stopped without converging; no estimate is reported
    NotConverged {
        status: FitStatus,
        iterations: usize,
        log_likelihood: f64,
    },
    Failed {
        cause: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantReport {
    pub name: String,
    pub covariates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<Vec<u32>>,
    pub events_considered: usize,
    pub strata: usize,
    pub records: usize,
    pub controls: usize,
    pub exclusions: ExclusionLog,
    pub outcome: VariantOutcome,
}

impl VariantReport {
    pub fn is_fitted(&self) -> bool {
        matches!(self.outcome, VariantOutcome::Fitted { .. })
    }

    pub fn estimate(&self, term: &str) -> Option<&Estimate> {
        match &self.outcome {
            VariantOutcome::Fitted { estimates, .. } => estimates.iter().find(|e| e.term == term),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub version: String,
    pub index: IndexSummary,
    /// Scene- and location-level exclusions from index construction
    pub index_exclusions: ExclusionLog,
    pub missingness: MissingnessDiagnostic,
    pub variants: Vec<VariantReport>,
}

impl AnalysisReport {
    pub fn variant(&self, name: &str) -> Option<&VariantReport> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Pure formatting; no computation beyond what the model result carries
pub struct ResultReporter;

impl ResultReporter {
    pub fn variant(spec: &VariantSpec, table: &StratumTable, result: &ModelResult) -> VariantReport {
        let outcome = match result.status {
            FitStatus::Converged => VariantOutcome::Fitted {
                iterations: result.iterations,
                log_likelihood: result.log_likelihood,
                likelihood_ratio: result.likelihood_ratio_statistic(),
                confidence_level: result.confidence_level,
                uncertainty_available: result.uncertainty_available(),
                separation_suspected: result.separation_suspected,
                estimates: result.estimates(),
            },
            status => VariantOutcome::NotConverged {
                status,
                iterations: result.iterations,
                log_likelihood: result.log_likelihood,
            },
        };
        Self::with_outcome(spec, Some(table), outcome)
    }

    pub fn failed(spec: &VariantSpec, table: Option<&StratumTable>, cause: impl ToString) -> VariantReport {
        Self::with_outcome(
            spec,
            table,
            VariantOutcome::Failed {
                cause: cause.to_string(),
            },
        )
    }

    fn with_outcome(spec: &VariantSpec, table: Option<&StratumTable>, outcome: VariantOutcome) -> VariantReport {
        VariantReport {
            name: spec.name.clone(),
            covariates: spec.covariates.clone(),
            months: spec.months.clone(),
            events_considered: table.map_or(0, |t| t.events_considered()),
            strata: table.map_or(0, |t| t.len()),
            records: table.map_or(0, |t| t.record_count()),
            controls: table.map_or(0, |t| t.control_count()),
            exclusions: table.map(|t| t.exclusions().clone()).unwrap_or_default(),
            outcome,
        }
    }

    pub fn analysis(index: &ExposureIndex, variants: Vec<VariantReport>) -> AnalysisReport {
        AnalysisReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            index: index.summary(),
            index_exclusions: index.exclusions().clone(),
            missingness: index.missingness().clone(),
            variants,
        }
    }

    pub fn to_json(report: &AnalysisReport) -> HeatResult<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    /// Short human-readable summary, one block per variant
    pub fn render_text(report: &AnalysisReport) -> String {
        let mut out = String::new();
        let index = &report.index;
        let _ = writeln!(
            out,
            "Scenes: {} usable / {} total; {} observations at {} locations",
            index.scenes_usable, index.scenes_total, index.observations, index.locations_observed
        );
        if let Some(diff) = report.missingness.mean_difference {
            let _ = writeln!(out, "Missingness: retained minus excluded mean exposure = {:.3}", diff);
        }

        for variant in &report.variants {
            let _ = writeln!(
                out,
                "\n[{}] {} strata, {} records from {} events",
                variant.name, variant.strata, variant.records, variant.events_considered
            );
            match &variant.outcome {
                VariantOutcome::Fitted {
                    estimates,
                    uncertainty_available,
                    confidence_level,
                    separation_suspected,
                    ..
                } => {
                    for e in estimates {
                        match (e.ci_lower, e.ci_upper) {
                            (Some(lo), Some(hi)) => {
                                let _ = writeln!(
                                    out,
                                    "  {:<16} OR {:.4} ({:.0}% CI {:.4} - {:.4})",
                                    e.term,
                                    e.odds_ratio,
                                    confidence_level * 100.0,
                                    lo,
                                    hi
                                );
                            }
                            _ => {
                                let _ = writeln!(out, "  {:<16} OR {:.4}", e.term, e.odds_ratio);
                            }
                        }
                    }
                    if *separation_suspected {
                        let _ = writeln!(
                            out,
                            "  separation suspected: cases perfectly separated from controls, estimate unbounded"
                        );
                    } else if !uncertainty_available {
                        let _ = writeln!(out, "  uncertainty unavailable (singular information)");
                    }
                }
                VariantOutcome::NotConverged { status, iterations, .. } => {
                    let _ = writeln!(out, "  not converged ({:?} after {} iterations)", status, iterations);
                }
                VariantOutcome::Failed { cause } => {
                    let _ = writeln!(out, "  failed: {}", cause);
                }
            }
        }
        out
    }
}
