//! Conditional (fixed-effects-by-stratum) logistic regression.
//!
//! Each stratum contributes log[exp(η_case) / Σ_i exp(η_i)], so the
//! stratum-specific baseline risk cancels and only within-stratum contrasts
//! inform the coefficients. Fitted by damped Newton-Raphson with step halving.

use crate::core::linalg::{normal_quantile, SpdFactor};
use crate::core::temporal_match::StratumTable;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Line-search halvings before an iteration is declared stalled
const MAX_HALVINGS: usize = 30;

/// Optimizer and reporting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    /// Refuse to fit below this many valid strata
    pub min_strata: usize,
    pub max_iterations: usize,
    /// Converged when max |gradient| falls below this
    pub gradient_tolerance: f64,
    /// ... or when an accepted step improves the log-likelihood by less than this
    pub loglik_tolerance: f64,
    pub confidence_level: f64,
    /// Any |coefficient| above this stops the fit as diverged (separation)
    pub max_abs_coefficient: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            min_strata: 50,
            max_iterations: 100,
            gradient_tolerance: 1e-8,
            loglik_tolerance: 1e-10,
            confidence_level: 0.95,
            max_abs_coefficient: 50.0,
        }
    }
}

/// Reasons the engine refuses to produce a fit
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("no valid strata to fit")]
    NoStrata,

    #[error("underpowered: {strata} valid strata, at least {minimum} required")]
    Underpowered { strata: usize, minimum: usize },

    #[error("model has no terms")]
    EmptyDesign,

    #[error("stratum {stratum} has {found} columns, expected {expected}")]
    DimensionMismatch {
        stratum: usize,
        found: usize,
        expected: usize,
    },

    #[error("stratum {stratum} has no control rows")]
    DegenerateStratum { stratum: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    /// Iteration cap reached or line search stalled
    NotConverged,
    /// Coefficients grew past the divergence bound
    Diverged,
}

/// Per-term estimate derived from a model result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub term: String,
    pub coefficient: f64,
    pub std_error: Option<f64>,
    pub z_value: Option<f64>,
    pub odds_ratio: f64,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

/// Outcome of one fit
#[derive(Debug, Clone, Serialize)]
pub struct ModelResult {
    pub terms: Vec<String>,
    pub coefficients: Vec<f64>,
    /// Inverse observed information; None when singular, separated or not converged
    pub covariance: Option<Array2<f64>>,
    pub status: FitStatus,
    pub iterations: usize,
    pub log_likelihood: f64,
    /// Log-likelihood at all coefficients zero
    pub null_log_likelihood: f64,
    pub gradient_norm: f64,
    pub n_strata: usize,
    pub n_records: usize,
    pub confidence_level: f64,
    /// Converged to a numerically perfect within-stratum fit
    pub separation_suspected: bool,
}

impl ModelResult {
    pub fn is_converged(&self) -> bool {
        self.status == FitStatus::Converged
    }

    pub fn uncertainty_available(&self) -> bool {
        self.covariance.is_some()
    }

    pub fn odds_ratios(&self) -> Vec<f64> {
        self.coefficients.iter().map(|b| b.exp()).collect()
    }

    pub fn std_errors(&self) -> Option<Vec<f64>> {
        self.covariance
            .as_ref()
            .map(|cov| (0..cov.nrows()).map(|i| cov[[i, i]].sqrt()).collect())
    }

    /// z for a two-sided interval at the configured confidence level
    pub fn critical_value(&self) -> f64 {
        normal_quantile(0.5 + self.confidence_level / 2.0)
    }

    pub fn likelihood_ratio_statistic(&self) -> f64 {
        2.0 * (self.log_likelihood - self.null_log_likelihood)
    }

    pub fn estimates(&self) -> Vec<Estimate> {
        let z = self.critical_value();
        let std_errors = self.std_errors();
        self.terms
            .iter()
            .zip(&self.coefficients)
            .enumerate()
            .map(|(i, (term, &coefficient))| {
                let std_error = std_errors.as_ref().map(|se| se[i]);
                Estimate {
                    term: term.clone(),
                    coefficient,
                    std_error,
                    z_value: std_error.map(|se| coefficient / se),
                    odds_ratio: coefficient.exp(),
                    ci_lower: std_error.map(|se| (coefficient - z * se).exp()),
                    ci_upper: std_error.map(|se| (coefficient + z * se).exp()),
                }
            })
            .collect()
    }
}

struct Evaluation {
    log_likelihood: f64,
    gradient: Array1<f64>,
    information: Array2<f64>,
}

impl Evaluation {
    fn gradient_norm(&self) -> f64 {
        self.gradient.iter().fold(0.0, |acc, g| acc.max(g.abs()))
    }
}

/// Log-likelihood, score and observed information over centred designs
fn evaluate(designs: &[Array2<f64>], beta: &Array1<f64>) -> Evaluation {
    let p = beta.len();
    let mut log_likelihood = 0.0;
    let mut gradient = Array1::<f64>::zeros(p);
    let mut information = Array2::<f64>::zeros((p, p));

    for x in designs {
        let eta = x.dot(beta);
        let max_eta = eta.fold(f64::NEG_INFINITY, |m, &e| m.max(e));
        let weights = eta.mapv(|e| (e - max_eta).exp());
        let total = weights.sum();
        log_likelihood += eta[0] - (max_eta + total.ln());

        let probs = weights / total;
        let mean = x.t().dot(&probs);
        gradient += &(&x.row(0) - &mean);

        for (i, row) in x.rows().into_iter().enumerate() {
            let deviation = &row - &mean;
            for a in 0..p {
                for c in 0..p {
                    information[[a, c]] += probs[i] * deviation[a] * deviation[c];
                }
            }
        }
    }

    Evaluation {
        log_likelihood,
        gradient,
        information,
    }
}

/// Newton direction, ridge-damped while the information is not positive definite
fn newton_direction(information: &Array2<f64>, gradient: &Array1<f64>) -> Array1<f64> {
    if let Some(factor) = SpdFactor::new(information) {
        return factor.solve(gradient);
    }

    let p = gradient.len();
    let mean_diag = information.diag().sum() / p.max(1) as f64;
    let mut ridge = 1e-8 * mean_diag.abs().max(1.0);
    for _ in 0..20 {
        let damped = information + &(Array2::<f64>::eye(p) * ridge);
        if let Some(factor) = SpdFactor::new(&damped) {
            return factor.solve(gradient);
        }
        ridge *= 10.0;
    }
    log::debug!("Information not factorisable, falling back to gradient step");
    gradient.clone()
}

/// Stratified regression engine
pub struct ConditionalLogit {
    config: RegressionConfig,
}

impl ConditionalLogit {
    pub fn new(config: RegressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    /// Fit exposure plus the table's covariates
    pub fn fit_table(&self, table: &StratumTable) -> Result<ModelResult, FitError> {
        let designs: Vec<Array2<f64>> = table.strata().iter().map(|s| s.design_matrix()).collect();
        self.fit(&table.term_names(), &designs)
    }

    /// Fit over per-stratum design matrices whose row 0 is the case
    pub fn fit(&self, terms: &[String], designs: &[Array2<f64>]) -> Result<ModelResult, FitError> {
        if designs.is_empty() {
            return Err(FitError::NoStrata);
        }
        if designs.len() < self.config.min_strata {
            return Err(FitError::Underpowered {
                strata: designs.len(),
                minimum: self.config.min_strata,
            });
        }
        let p = terms.len();
        if p == 0 {
            return Err(FitError::EmptyDesign);
        }

        let mut centred = Vec::with_capacity(designs.len());
        for (stratum, design) in designs.iter().enumerate() {
            if design.ncols() != p {
                return Err(FitError::DimensionMismatch {
                    stratum,
                    found: design.ncols(),
                    expected: p,
                });
            }
            if design.nrows() < 2 {
                return Err(FitError::DegenerateStratum { stratum });
            }
            // Within-stratum shifts leave the likelihood unchanged
            let case = design.row(0).to_owned();
            centred.push(design - &case);
        }
        let n_records = designs.iter().map(|d| d.nrows()).sum();

        log::debug!(
            "Fitting conditional logit: {} strata, {} records, {} terms",
            designs.len(),
            n_records,
            p
        );

        let mut beta = Array1::<f64>::zeros(p);
        let mut current = evaluate(&centred, &beta);
        let null_log_likelihood = current.log_likelihood;
        let mut status = FitStatus::NotConverged;
        let mut iterations = 0;

        if current.gradient_norm() < self.config.gradient_tolerance {
            status = FitStatus::Converged;
        }

        while status != FitStatus::Converged && iterations < self.config.max_iterations {
            let direction = newton_direction(&current.information, &current.gradient);
            let slack = 1e-12 * (1.0 + current.log_likelihood.abs());

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let candidate = &beta + &(&direction * step);
                let trial = evaluate(&centred, &candidate);
                if trial.log_likelihood.is_finite() && trial.log_likelihood >= current.log_likelihood - slack {
                    accepted = Some((candidate, trial));
                    break;
                }
                step *= 0.5;
            }
            iterations += 1;

            let Some((candidate, trial)) = accepted else {
                log::warn!("Line search stalled after {} iterations", iterations);
                break;
            };

            let improvement = trial.log_likelihood - current.log_likelihood;
            beta = candidate;
            current = trial;

            if beta.iter().any(|b| !b.is_finite() || b.abs() > self.config.max_abs_coefficient) {
                log::warn!("Coefficients diverged after {} iterations (separation?)", iterations);
                status = FitStatus::Diverged;
                break;
            }
            if current.gradient_norm() < self.config.gradient_tolerance
                || improvement.abs() < self.config.loglik_tolerance
            {
                status = FitStatus::Converged;
            }
        }

        if status == FitStatus::NotConverged {
            log::warn!(
                "Conditional logit did not converge in {} iterations (|grad| = {:.3e})",
                iterations,
                current.gradient_norm()
            );
        }

        let separation_suspected = status == FitStatus::Converged && current.log_likelihood > -1e-6;

        // Separated fits have their optimum at infinity; no covariance
        let covariance = if status != FitStatus::Converged {
            None
        } else if separation_suspected {
            log::warn!("Fit separates cases from controls; uncertainty withheld");
            None
        } else {
            let covariance = SpdFactor::new(&current.information).map(|factor| factor.inverse());
            if covariance.is_none() {
                log::warn!("Information matrix singular at convergence; uncertainty unavailable");
            }
            covariance
        };

        Ok(ModelResult {
            terms: terms.to_vec(),
            coefficients: beta.to_vec(),
            covariance,
            status,
            iterations,
            log_likelihood: current.log_likelihood,
            null_log_likelihood,
            gradient_norm: current.gradient_norm(),
            n_strata: designs.len(),
            n_records,
            confidence_level: self.config.confidence_level,
            separation_suspected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn engine(min_strata: usize) -> ConditionalLogit {
        ConditionalLogit::new(RegressionConfig {
            min_strata,
            ..Default::default()
        })
    }

    fn exposure_term() -> Vec<String> {
        vec!["exposure".to_string()]
    }

    /// 1:1 pairs, `hotter` with the case one unit above its control and `cooler` the reverse
    fn pairs(hotter: usize, cooler: usize) -> Vec<Array2<f64>> {
        let mut designs = vec![array![[1.0], [0.0]]; hotter];
        designs.extend(vec![array![[0.0], [1.0]]; cooler]);
        designs
    }

    #[test]
    fn test_matched_pairs_closed_form() {
        // MLE for 1:1 pairs with a unit contrast: log(hotter / cooler)
        let result = engine(10).fit(&exposure_term(), &pairs(30, 10)).unwrap();
        assert!(result.is_converged());
        assert_relative_eq!(result.coefficients[0], 3.0f64.ln(), epsilon = 1e-6);

        let se = result.std_errors().unwrap()[0];
        assert_relative_eq!(se, (1.0 / 30.0 + 1.0 / 10.0f64).sqrt(), epsilon = 1e-6);

        let estimate = &result.estimates()[0];
        assert_relative_eq!(estimate.odds_ratio, 3.0, epsilon = 1e-5);
        let z = normal_quantile(0.975);
        assert_relative_eq!(estimate.ci_lower.unwrap(), (3.0f64.ln() - z * se).exp(), epsilon = 1e-6);
        assert!(estimate.ci_lower.unwrap() < 3.0 && estimate.ci_upper.unwrap() > 3.0);
        assert!(result.likelihood_ratio_statistic() > 0.0);
    }

    #[test]
    fn test_odds_ratio_matches_coefficient() {
        let result = engine(1).fit(&exposure_term(), &pairs(7, 3)).unwrap();
        for (estimate, &b) in result.estimates().iter().zip(&result.coefficients) {
            assert_relative_eq!(estimate.odds_ratio, b.exp(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_underpowered_refuses_to_fit() {
        let err = engine(50).fit(&exposure_term(), &pairs(1, 1)).unwrap_err();
        assert_eq!(err, FitError::Underpowered { strata: 2, minimum: 50 });
        assert_eq!(engine(1).fit(&exposure_term(), &[]).unwrap_err(), FitError::NoStrata);
    }

    #[test]
    fn test_separated_fit_withholds_uncertainty() {
        let designs = vec![array![[30.0], [22.0], [24.0]]];
        let result = engine(1).fit(&exposure_term(), &designs).unwrap();
        assert!(result.is_converged());
        assert!(result.coefficients[0] > 0.0);
        assert!(result.separation_suspected);
        assert!(!result.uncertainty_available());

        let estimate = &result.estimates()[0];
        assert!(estimate.odds_ratio > 1.0);
        assert!(estimate.std_error.is_none());
        assert!(estimate.ci_lower.is_none() && estimate.ci_upper.is_none());
    }

    #[test]
    fn test_singular_information_reports_no_uncertainty() {
        // Second term is constant within every stratum
        let designs: Vec<Array2<f64>> = pairs(12, 4)
            .into_iter()
            .map(|d| array![[d[[0, 0]], 5.0], [d[[1, 0]], 5.0]])
            .collect();
        let terms = vec!["exposure".to_string(), "humidity".to_string()];
        let result = engine(1).fit(&terms, &designs).unwrap();

        assert!(result.is_converged());
        assert!(!result.uncertainty_available());
        assert_relative_eq!(result.coefficients[0], 3.0f64.ln(), epsilon = 1e-6);
        let estimates = result.estimates();
        assert!(estimates.iter().all(|e| e.std_error.is_none() && e.ci_lower.is_none()));
    }

    #[test]
    fn test_iteration_cap_reports_non_convergence() {
        let result = ConditionalLogit::new(RegressionConfig {
            min_strata: 1,
            max_iterations: 1,
            ..Default::default()
        })
        .fit(&exposure_term(), &pairs(30, 10))
        .unwrap();
        assert_eq!(result.status, FitStatus::NotConverged);
        assert!(!result.uncertainty_available());
    }

    #[test]
    fn test_separation_diverges() {
        let result = ConditionalLogit::new(RegressionConfig {
            min_strata: 1,
            max_abs_coefficient: 2.0,
            ..Default::default()
        })
        .fit(&exposure_term(), &pairs(5, 0))
        .unwrap();
        assert_eq!(result.status, FitStatus::Diverged);
    }

    #[test]
    fn test_dimension_mismatch() {
        let designs = vec![array![[1.0, 2.0], [0.0, 1.0]]];
        let err = engine(1).fit(&exposure_term(), &designs).unwrap_err();
        assert_eq!(
            err,
            FitError::DimensionMismatch {
                stratum: 0,
                found: 2,
                expected: 1
            }
        );
    }
}
