//! # Per-Replicate Estimation
//!
//! Drives the four competing methods over one replicate: three two-step
//! predictors through closed-form OLS, and the joint SEM through the
//! `SemFitting` seam. Failures are isolated per method per replicate — a
//! failed SEM or factor extraction yields a non-converged `Estimate` with no
//! statistics, never an aborted batch. Two-step OLS has no iterative failure
//! mode; its only guards are degenerate scores, which the generation
//! invariants rule out in practice.

use crate::fa::FactorExtraction;
use crate::generate::{generate, GenerationError, Replicate};
use crate::grid::Condition;
use crate::reliability::standardized_alpha;
use crate::scores::{factor_score, single_item_score, sum_score};
use crate::sem::SemFitting;
use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use thiserror::Error;

/// The four competing methods, in reporting order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    SingleItem,
    SumScore,
    FactorScore,
    Sem,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::SingleItem,
        Method::SumScore,
        Method::FactorScore,
        Method::Sem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SingleItem => "single_item",
            Method::SumScore => "sum_score",
            Method::FactorScore => "factor_score",
            Method::Sem => "sem",
        }
    }

    /// Position of this method in `Method::ALL` and in every per-method array.
    pub fn index(&self) -> usize {
        match self {
            Method::SingleItem => 0,
            Method::SumScore => 1,
            Method::FactorScore => 2,
            Method::Sem => 3,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One method's result on one replicate. A failed fit keeps both statistics
/// `None`; it is excluded from coefficient/SE aggregation but still counts
/// toward the failure-rate denominator.
#[derive(Clone, Debug, Serialize)]
pub struct Estimate {
    pub method: Method,
    pub coefficient: Option<f64>,
    pub std_error: Option<f64>,
    pub converged: bool,
}

impl Estimate {
    pub fn converged(method: Method, coefficient: f64, std_error: f64) -> Self {
        Self {
            method,
            coefficient: Some(coefficient),
            std_error: Some(std_error),
            converged: true,
        }
    }

    pub fn failed(method: Method) -> Self {
        Self {
            method,
            coefficient: None,
            std_error: None,
            converged: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("score length {score} does not match outcome length {outcome}")]
    LengthMismatch { score: usize, outcome: usize },

    #[error("need at least 3 observations for OLS, got {0}")]
    TooFewObservations(usize),

    #[error("score has (near-)zero variance; OLS slope undefined")]
    DegenerateScore,
}

/// Ordinary least squares of the outcome on one predictor (with intercept).
/// Returns the slope and its standard error from `σ̂² = RSS/(n−2)`.
pub fn ols(score: ArrayView1<f64>, outcome: ArrayView1<f64>) -> Result<(f64, f64), EstimationError> {
    let n = score.len();
    if n != outcome.len() {
        return Err(EstimationError::LengthMismatch {
            score: n,
            outcome: outcome.len(),
        });
    }
    if n < 3 {
        return Err(EstimationError::TooFewObservations(n));
    }
    let nf = n as f64;
    let score_mean = score.sum() / nf;
    let outcome_mean = outcome.sum() / nf;
    let sxx: f64 = score.iter().map(|s| (s - score_mean).powi(2)).sum();
    if sxx <= 1e-12 {
        return Err(EstimationError::DegenerateScore);
    }
    let sxy: f64 = score
        .iter()
        .zip(outcome.iter())
        .map(|(s, y)| (s - score_mean) * (y - outcome_mean))
        .sum();
    let slope = sxy / sxx;
    let rss: f64 = score
        .iter()
        .zip(outcome.iter())
        .map(|(s, y)| {
            let fitted = outcome_mean + slope * (s - score_mean);
            (y - fitted).powi(2)
        })
        .sum();
    let sigma2 = rss / (nf - 2.0);
    Ok((slope, (sigma2 / sxx).sqrt()))
}

/// Runs one two-step method: OLS of the outcome on an already-standardized
/// score. OLS guards should never trip under the generation invariants; if
/// one does, the estimate is recorded as failed rather than propagated.
pub fn run_two_step(
    score: ArrayView1<f64>,
    outcome: ArrayView1<f64>,
    method: Method,
) -> Estimate {
    match ols(score, outcome) {
        Ok((coefficient, std_error)) => Estimate::converged(method, coefficient, std_error),
        Err(e) => {
            log::warn!("{method} estimation failed: {e}");
            Estimate::failed(method)
        }
    }
}

/// Runs the SEM method, mapping any fitting error to a non-converged
/// estimate for this replicate.
pub fn run_sem(replicate: &Replicate, fitter: &dyn SemFitting) -> Estimate {
    match fitter.fit(replicate.indicators.view(), replicate.outcome.view()) {
        Ok(fit) => Estimate::converged(Method::Sem, fit.coefficient, fit.std_error),
        Err(e) => {
            log::warn!("SEM fit failed: {e}");
            Estimate::failed(Method::Sem)
        }
    }
}

/// All derived results for one replicate, in `Method::ALL` order.
#[derive(Clone, Debug)]
pub struct ReplicateResult {
    pub estimates: [Estimate; 4],
    pub reliability: Option<f64>,
}

impl ReplicateResult {
    pub fn estimate(&self, method: Method) -> &Estimate {
        &self.estimates[method.index()]
    }
}

fn score_or_failed<E: std::fmt::Display>(
    score: Result<Array1<f64>, E>,
    outcome: ArrayView1<f64>,
    method: Method,
) -> Estimate {
    match score {
        Ok(score) => run_two_step(score.view(), outcome, method),
        Err(e) => {
            log::warn!("{method} score construction failed: {e}");
            Estimate::failed(method)
        }
    }
}

/// Generates one replicate and produces all four estimates plus the
/// reliability coefficient. Only invalid condition parameters propagate as an
/// error; every per-method failure is folded into its own estimate.
pub fn run_replicate(
    condition: &Condition,
    seed: u64,
    extractor: &dyn FactorExtraction,
    fitter: &dyn SemFitting,
) -> Result<ReplicateResult, GenerationError> {
    let replicate = generate(condition, seed)?;
    let outcome = replicate.outcome.view();

    let single = score_or_failed(single_item_score(&replicate), outcome, Method::SingleItem);
    let sum = score_or_failed(sum_score(&replicate), outcome, Method::SumScore);
    let factor = score_or_failed(
        factor_score(&replicate, extractor),
        outcome,
        Method::FactorScore,
    );
    let sem = run_sem(&replicate, fitter);

    let reliability = match standardized_alpha(replicate.indicators.view()) {
        Ok(alpha) => Some(alpha),
        Err(e) => {
            log::warn!("reliability computation failed: {e}");
            None
        }
    };

    Ok(ReplicateResult {
        estimates: [single, sum, factor, sem],
        reliability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fa::MlFactorAnalysis;
    use crate::sem::MlSemFitter;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn ols_is_exact_on_noiseless_data() {
        let x = array![-2.0, -1.0, 0.0, 1.0, 2.0];
        let y = array![-3.0, -1.0, 1.0, 3.0, 5.0]; // y = 1 + 2x
        let (slope, se) = ols(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(slope, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(se, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn ols_standard_error_matches_hand_computation() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![0.0, 1.1, 1.9, 3.1];
        let (slope, se) = ols(x.view(), y.view()).unwrap();
        // sxx = 5, sxy = 5.05, slope = 1.01, rss = 0.027, σ̂² = 0.0135.
        assert_abs_diff_eq!(slope, 1.01, epsilon = 1e-10);
        assert_abs_diff_eq!(se, (0.0135f64 / 5.0).sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn ols_rejects_degenerate_scores() {
        let x = array![1.0, 1.0, 1.0, 1.0];
        let y = array![0.0, 1.0, 2.0, 3.0];
        assert!(matches!(
            ols(x.view(), y.view()),
            Err(EstimationError::DegenerateScore)
        ));
        let short = array![1.0, 2.0];
        assert!(matches!(
            ols(short.view(), array![1.0, 2.0].view()),
            Err(EstimationError::TooFewObservations(2))
        ));
        assert!(matches!(
            ols(x.view(), array![1.0].view()),
            Err(EstimationError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn replicate_produces_all_four_methods_in_order() {
        let condition = Condition::new(0.8, 6, 0.5, 300);
        let result = run_replicate(
            &condition,
            77,
            &MlFactorAnalysis::default(),
            &MlSemFitter::default(),
        )
        .unwrap();
        for (estimate, method) in result.estimates.iter().zip(Method::ALL) {
            assert_eq!(estimate.method, method);
        }
        assert!(result.reliability.is_some());
        for estimate in &result.estimates {
            assert!(estimate.converged, "{} failed", estimate.method);
            assert!(estimate.coefficient.unwrap().is_finite());
            assert!(estimate.std_error.unwrap() > 0.0);
        }
    }
}
