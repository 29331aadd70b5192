//! # Single-Factor Maximum-Likelihood Factor Analysis
//!
//! Factor extraction is an external, possibly-failing collaborator from the
//! rest of the engine's point of view; `FactorExtraction` is that seam. The
//! default implementation
//! is Lawley's ML fixed point for one factor: iterate the leading
//! eigendecomposition of `Ψ^(−1/2) R Ψ^(−1/2)`, updating the uniquenesses
//! until they stabilize. Start values come from squared multiple correlations.
//!
//! Heywood cases (loadings ≥ 1 implying negative uniqueness) are handled by
//! flooring uniquenesses at a small positive constant; persistent
//! non-convergence or non-finite loadings surface as `FaError` and become a
//! failed factor-score estimate for that replicate only.

use crate::scores::{correlation_matrix, DegenerateInputError};
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_linalg::{Eigh, Inverse, UPLO};
use thiserror::Error;

/// Lower bound on uniquenesses. Keeps `Ψ^(−1/2)` finite through Heywood cases.
const UNIQUENESS_FLOOR: f64 = 0.005;

#[derive(Error, Debug)]
pub enum FaError {
    #[error("degenerate indicator matrix: {0}")]
    Degenerate(#[from] DegenerateInputError),

    #[error("eigendecomposition of the rescaled correlation matrix failed: {0}")]
    EigendecompositionFailed(#[from] ndarray_linalg::error::LinalgError),

    #[error(
        "uniqueness iteration did not converge within {max_iterations} iterations; \
         last change was {last_change:.3e}"
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("extraction produced non-finite loadings")]
    NonFiniteLoadings,
}

/// Output of a single-factor extraction.
#[derive(Clone, Debug)]
pub struct FaSolution {
    /// Estimated loadings in the correlation metric, sign-aligned so their
    /// sum is nonnegative.
    pub loadings: Array1<f64>,
    /// Estimated uniquenesses (1 − λ², floored).
    pub uniquenesses: Array1<f64>,
    /// Iterations used by the fixed point.
    pub iterations: usize,
}

/// The factor-extraction seam. Implementations may fail; callers must treat
/// failure as a per-replicate event, never a batch abort.
pub trait FactorExtraction: Sync {
    fn extract(&self, indicators: ArrayView2<f64>) -> Result<FaSolution, FaError>;
}

/// Lawley fixed-point ML extraction.
#[derive(Clone, Copy, Debug)]
pub struct MlFactorAnalysis {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for MlFactorAnalysis {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-6,
        }
    }
}

impl MlFactorAnalysis {
    /// Start values: uniqueness = 1 / diag(R⁻¹), i.e. one minus the squared
    /// multiple correlation. Falls back to 0.5 when R is not invertible; the
    /// fixed point then decides whether the problem is workable at all.
    fn initial_uniquenesses(r: &Array2<f64>, p: usize) -> Array1<f64> {
        match r.inv() {
            Ok(r_inv) => Array1::from_iter(
                (0..p).map(|j| (1.0 / r_inv[[j, j]]).clamp(UNIQUENESS_FLOOR, 1.0)),
            ),
            Err(_) => Array1::from_elem(p, 0.5),
        }
    }
}

impl FactorExtraction for MlFactorAnalysis {
    fn extract(&self, indicators: ArrayView2<f64>) -> Result<FaSolution, FaError> {
        let p = indicators.ncols();
        if p < 2 {
            return Err(DegenerateInputError::TooFewColumns(p).into());
        }
        let r = correlation_matrix(indicators)?;
        let mut psi = Self::initial_uniquenesses(&r, p);
        let mut last_change = f64::INFINITY;

        for iteration in 1..=self.max_iterations {
            let d: Array1<f64> = psi.mapv(|v| 1.0 / v.sqrt());
            let mut rescaled = Array2::zeros((p, p));
            for i in 0..p {
                for j in 0..p {
                    rescaled[[i, j]] = r[[i, j]] * d[i] * d[j];
                }
            }

            let (eigenvalues, eigenvectors) = rescaled.eigh(UPLO::Lower)?;
            // Eigenvalues arrive ascending; the single factor lives in the
            // leading pair.
            let theta = eigenvalues[p - 1];
            let v = eigenvectors.column(p - 1);
            let scale = (theta - 1.0).max(0.0).sqrt();

            let mut loadings =
                Array1::from_iter((0..p).map(|j| scale * v[j] * psi[j].sqrt()));
            if loadings.sum() < 0.0 {
                loadings.mapv_inplace(|l| -l);
            }

            let psi_new: Array1<f64> = loadings
                .mapv(|l| (1.0 - l * l).clamp(UNIQUENESS_FLOOR, 1.0));
            last_change = psi_new
                .iter()
                .zip(psi.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            psi = psi_new;

            if last_change < self.tolerance {
                if loadings.iter().any(|l| !l.is_finite()) {
                    return Err(FaError::NonFiniteLoadings);
                }
                return Ok(FaSolution {
                    loadings,
                    uniquenesses: psi,
                    iterations: iteration,
                });
            }
        }

        Err(FaError::DidNotConverge {
            max_iterations: self.max_iterations,
            last_change,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::generate;
    use crate::grid::Condition;
    use ndarray::Array2;

    #[test]
    fn recovers_strong_loadings() {
        let condition = Condition::new(0.8, 6, 0.5, 1000);
        let rep = generate(&condition, 42).unwrap();
        let solution = MlFactorAnalysis::default()
            .extract(rep.indicators.view())
            .unwrap();
        assert_eq!(solution.loadings.len(), 6);
        for (estimated, &truth) in solution.loadings.iter().zip(rep.loadings.iter()) {
            assert!(
                (estimated - truth).abs() < 0.12,
                "loading estimate {estimated} far from realized {truth}"
            );
        }
    }

    #[test]
    fn loadings_are_sign_aligned() {
        let condition = Condition::new(0.5, 3, 0.3, 500);
        for seed in 0..10 {
            let rep = generate(&condition, seed).unwrap();
            let solution = MlFactorAnalysis::default()
                .extract(rep.indicators.view())
                .unwrap();
            assert!(solution.loadings.sum() >= 0.0);
        }
    }

    #[test]
    fn uniquenesses_stay_in_bounds() {
        let condition = Condition::new(0.95, 3, 0.3, 100);
        for seed in 0..20 {
            let rep = generate(&condition, seed).unwrap();
            if let Ok(solution) = MlFactorAnalysis::default().extract(rep.indicators.view())
            {
                for &u in solution.uniquenesses.iter() {
                    assert!((UNIQUENESS_FLOOR..=1.0).contains(&u));
                }
            }
        }
    }

    #[test]
    fn rejects_single_column() {
        let data = Array2::from_shape_fn((50, 1), |(i, _)| i as f64);
        assert!(matches!(
            MlFactorAnalysis::default().extract(data.view()),
            Err(FaError::Degenerate(DegenerateInputError::TooFewColumns(1)))
        ));
    }
}
