//! # Predictor Construction
//!
//! Builds the three two-step predictors from a replicate's indicator matrix:
//! a single observed item, the row-mean composite, and Thurstone regression
//! factor scores from maximum-likelihood loadings. Every score is standardized
//! (mean 0, unit variance) before it reaches the regression step so the
//! structural coefficients are comparable across methods and against the true
//! effect.

use crate::fa::{FaError, FactorExtraction};
use crate::generate::Replicate;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use thiserror::Error;

/// Variances at or below this are treated as zero.
const VARIANCE_FLOOR: f64 = 1e-12;

/// Degenerate indicator data. Raised eagerly instead of letting downstream
/// arithmetic return misleading zeros or NaNs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DegenerateInputError {
    #[error("need at least 2 indicator columns, got {0}")]
    TooFewColumns(usize),

    #[error("need at least 2 rows to compute sample moments, got {0}")]
    TooFewRows(usize),

    #[error("indicator column {0} has (near-)zero variance")]
    ZeroVarianceColumn(usize),

    #[error("input vector has (near-)zero variance")]
    ZeroVarianceVector,

    #[error("correlation structure is degenerate; statistic undefined")]
    DegenerateCorrelation,
}

/// Factor-score construction failures. The extraction variant carries the
/// factor-analysis routine's own error; the others arise while turning
/// loadings into scores.
#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("factor extraction failed: {0}")]
    Extraction(#[from] FaError),

    #[error("degenerate indicators: {0}")]
    Degenerate(#[from] DegenerateInputError),

    #[error("solving R·w = loadings failed; correlation matrix may be singular: {0}")]
    WeightSolveFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// Standardizes a vector to mean 0 and unit variance (n−1 divisor).
pub fn standardize(x: ArrayView1<f64>) -> Result<Array1<f64>, DegenerateInputError> {
    let n = x.len();
    if n < 2 {
        return Err(DegenerateInputError::TooFewRows(n));
    }
    let mean = x.sum() / n as f64;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    if var <= VARIANCE_FLOOR {
        return Err(DegenerateInputError::ZeroVarianceVector);
    }
    let sd = var.sqrt();
    Ok(x.mapv(|v| (v - mean) / sd))
}

/// Standardizes every column of a matrix.
pub fn column_standardize(m: ArrayView2<f64>) -> Result<Array2<f64>, DegenerateInputError> {
    let (n, p) = m.dim();
    if n < 2 {
        return Err(DegenerateInputError::TooFewRows(n));
    }
    let mut out = Array2::zeros((n, p));
    for (j, col) in m.axis_iter(Axis(1)).enumerate() {
        let std_col =
            standardize(col).map_err(|_| DegenerateInputError::ZeroVarianceColumn(j))?;
        out.column_mut(j).assign(&std_col);
    }
    Ok(out)
}

/// Sample correlation matrix of the columns (n−1 divisor).
pub fn correlation_matrix(m: ArrayView2<f64>) -> Result<Array2<f64>, DegenerateInputError> {
    let (n, p) = m.dim();
    if p < 2 {
        return Err(DegenerateInputError::TooFewColumns(p));
    }
    let z = column_standardize(m)?;
    Ok(z.t().dot(&z) / (n as f64 - 1.0))
}

/// The single-item predictor: indicator column 0, standardized.
///
/// The column is fixed rather than drawn per replicate; with exchangeable
/// items the choice is arbitrary, and fixing it keeps the method's sampling
/// variability attributable to the loading re-draw alone.
pub fn single_item_score(replicate: &Replicate) -> Result<Array1<f64>, DegenerateInputError> {
    let p = replicate.indicators.ncols();
    if p < 2 {
        return Err(DegenerateInputError::TooFewColumns(p));
    }
    standardize(replicate.indicators.column(0))
}

/// The composite predictor: row mean of all indicators, standardized.
/// (Mean rather than sum; the two are identical after standardization.)
pub fn sum_score(replicate: &Replicate) -> Result<Array1<f64>, DegenerateInputError> {
    let p = replicate.indicators.ncols();
    if p < 2 {
        return Err(DegenerateInputError::TooFewColumns(p));
    }
    let means = replicate.indicators.mean_axis(Axis(1)).ok_or(
        DegenerateInputError::TooFewColumns(p),
    )?;
    standardize(means.view())
}

/// Thurstone regression factor scores: `S = Z · R⁻¹λ̂`, standardized.
///
/// The maximum-likelihood loading vector comes from the injected extraction
/// routine; this function owns only the weight solve and score assembly.
pub fn factor_score(
    replicate: &Replicate,
    extractor: &dyn FactorExtraction,
) -> Result<Array1<f64>, ScoreError> {
    let indicators = replicate.indicators.view();
    let solution = extractor.extract(indicators)?;
    let r = correlation_matrix(indicators)?;
    let weights = r.solve(&solution.loadings)?;
    let z = column_standardize(indicators)?;
    let raw = z.dot(&weights);
    Ok(standardize(raw.view())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fa::MlFactorAnalysis;
    use crate::generate::generate;
    use crate::grid::Condition;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn mean_and_sd(x: &Array1<f64>) -> (f64, f64) {
        let n = x.len() as f64;
        let mean = x.sum() / n;
        let sd =
            (x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
        (mean, sd)
    }

    #[test]
    fn standardize_hits_zero_mean_unit_sd() {
        let x = array![1.0, 2.0, 3.0, 4.0, 10.0];
        let z = standardize(x.view()).unwrap();
        let (mean, sd) = mean_and_sd(&z);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sd, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn standardize_rejects_constant_input() {
        let x = array![3.0, 3.0, 3.0, 3.0];
        assert!(matches!(
            standardize(x.view()),
            Err(DegenerateInputError::ZeroVarianceVector)
        ));
    }

    #[test]
    fn all_scores_are_standardized() {
        let condition = Condition::new(0.8, 6, 0.5, 500);
        let rep = generate(&condition, 11).unwrap();
        let extractor = MlFactorAnalysis::default();

        for score in [
            single_item_score(&rep).unwrap(),
            sum_score(&rep).unwrap(),
            factor_score(&rep, &extractor).unwrap(),
        ] {
            let (mean, sd) = mean_and_sd(&score);
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(sd, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn correlation_matrix_has_unit_diagonal() {
        let condition = Condition::new(0.5, 3, 0.3, 300);
        let rep = generate(&condition, 5).unwrap();
        let r = correlation_matrix(rep.indicators.view()).unwrap();
        for j in 0..3 {
            assert_abs_diff_eq!(r[[j, j]], 1.0, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(r[[0, 1]], r[[1, 0]], epsilon = 1e-12);
    }

    #[test]
    fn factor_score_tracks_latent_factor_when_loadings_are_strong() {
        let condition = Condition::new(0.8, 6, 0.5, 1000);
        let rep = generate(&condition, 21).unwrap();
        let score = factor_score(&rep, &MlFactorAnalysis::default()).unwrap();
        let factor_std = standardize(rep.factor.view()).unwrap();
        let corr = score.dot(&factor_std) / (score.len() as f64 - 1.0);
        assert!(
            corr > 0.9,
            "factor score should track the latent factor, corr = {corr}"
        );
    }
}
