//! Standardized internal-consistency reliability (Cronbach's alpha on the
//! correlation metric): `α = k·r̄ / (1 + (k−1)·r̄)` with `r̄` the mean
//! off-diagonal correlation. The standardized form is used so reliability is
//! comparable across conditions regardless of item scaling.

use crate::scores::{correlation_matrix, DegenerateInputError};
use ndarray::ArrayView2;

pub fn standardized_alpha(indicators: ArrayView2<f64>) -> Result<f64, DegenerateInputError> {
    let p = indicators.ncols();
    if p < 2 {
        return Err(DegenerateInputError::TooFewColumns(p));
    }
    let r = correlation_matrix(indicators)?;
    let k = p as f64;
    let mean_off_diagonal = (r.sum() - k) / (k * (k - 1.0));
    let denominator = 1.0 + (k - 1.0) * mean_off_diagonal;
    if denominator.abs() < 1e-12 {
        return Err(DegenerateInputError::DegenerateCorrelation);
    }
    let alpha = k * mean_off_diagonal / denominator;
    if !alpha.is_finite() {
        return Err(DegenerateInputError::DegenerateCorrelation);
    }
    Ok(alpha)
}
