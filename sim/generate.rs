//! # Synthetic Data Generation
//!
//! One replicate is one synthetic dataset drawn under a `Condition`: a latent
//! factor, a fresh set of realized item loadings, unit-variance indicators,
//! and an outcome carrying the true structural effect. Generation is a pure
//! function of `(condition, seed)` — identical arguments produce bit-identical
//! replicates, which is what makes parallel re-runs reproducible.
//!
//! The loadings are re-drawn for every replicate around the condition's
//! population mean (sd 0.1). This is deliberate: each replicate simulates a
//! study whose true population loadings themselves vary around the design
//! value, so "true loading" in the results is a population mean, not a fixed
//! constant.

use crate::grid::Condition;
use crate::scores::{standardize, DegenerateInputError};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Normal, StandardNormal};
use thiserror::Error;

/// Fixed outcome intercept used by the generator.
pub const INTERCEPT: f64 = 2.0;
/// Standard deviation of the per-replicate loading draws.
pub const LOADING_SD: f64 = 0.1;

/// Loadings at or beyond ±1 would imply nonpositive indicator noise variance.
/// Draws outside this bound are re-drawn, then clamped as a last resort.
const MAX_ABS_LOADING: f64 = 0.999;
const LOADING_REDRAW_LIMIT: usize = 16;

/// Invalid condition parameters. Surfaced before any random draw happens;
/// never raised mid-replicate.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("condition requests {0} indicators; at least 2 are required")]
    TooFewItems(usize),

    #[error("sample size {0} is too small; at least 4 observations are required")]
    SampleTooSmall(usize),

    #[error("condition parameter '{0}' is not finite")]
    NonFiniteParameter(&'static str),

    #[error("mean loading {0} must lie strictly inside (-1, 1)")]
    LoadingOutOfRange(f64),

    #[error("factor variance must be positive, got {0}")]
    NonPositiveFactorVariance(f64),

    #[error("latent factor draw was degenerate: {0}")]
    DegenerateFactor(#[from] DegenerateInputError),
}

/// One simulated dataset. Created fresh per replicate and discarded once its
/// estimates have been folded into the condition aggregate.
#[derive(Clone, Debug)]
pub struct Replicate {
    pub condition: Condition,
    /// Latent factor, length `sample_size`.
    pub factor: Array1<f64>,
    /// Realized loadings for this replicate, length `num_items`.
    pub loadings: Array1<f64>,
    /// Indicator matrix, `sample_size` × `num_items`, unit variance per item.
    pub indicators: Array2<f64>,
    /// Outcome vector, length `sample_size`.
    pub outcome: Array1<f64>,
}

fn validate(condition: &Condition) -> Result<(), GenerationError> {
    if condition.num_items < 2 {
        return Err(GenerationError::TooFewItems(condition.num_items));
    }
    if condition.sample_size < 4 {
        return Err(GenerationError::SampleTooSmall(condition.sample_size));
    }
    if !condition.mean_loading.is_finite() {
        return Err(GenerationError::NonFiniteParameter("mean_loading"));
    }
    if !condition.effect_size.is_finite() {
        return Err(GenerationError::NonFiniteParameter("effect_size"));
    }
    if !condition.factor_variance.is_finite() {
        return Err(GenerationError::NonFiniteParameter("factor_variance"));
    }
    if condition.mean_loading.abs() >= 1.0 {
        return Err(GenerationError::LoadingOutOfRange(condition.mean_loading));
    }
    if condition.factor_variance <= 0.0 {
        return Err(GenerationError::NonPositiveFactorVariance(
            condition.factor_variance,
        ));
    }
    Ok(())
}

/// Draws one loading, re-drawing when the draw would imply nonpositive
/// indicator noise variance. After `LOADING_REDRAW_LIMIT` rejections the draw
/// is clamped instead, so generation always terminates.
fn draw_loading(rng: &mut StdRng, dist: &Normal<f64>) -> f64 {
    for _ in 0..LOADING_REDRAW_LIMIT {
        let l: f64 = rng.sample(dist);
        if l.abs() < MAX_ABS_LOADING {
            return l;
        }
    }
    let l: f64 = rng.sample(dist);
    l.clamp(-MAX_ABS_LOADING, MAX_ABS_LOADING)
}

/// Generates one replicate. Pure: deterministic given `(condition, seed)`,
/// no side effects beyond the returned value.
///
/// Draw order is fixed (loadings, factor, indicator noise column-major,
/// outcome noise) and is part of the reproducibility contract.
pub fn generate(condition: &Condition, seed: u64) -> Result<Replicate, GenerationError> {
    validate(condition)?;
    let n = condition.sample_size;
    let p = condition.num_items;
    let mut rng = StdRng::seed_from_u64(seed);

    let loading_dist = Normal::new(condition.mean_loading, LOADING_SD)
        .map_err(|_| GenerationError::NonFiniteParameter("mean_loading"))?;
    let loadings = Array1::from_iter((0..p).map(|_| draw_loading(&mut rng, &loading_dist)));

    let factor_sd = condition.factor_variance.sqrt();
    let factor = Array1::from_iter(
        (0..n).map(|_| factor_sd * rng.sample::<f64, _>(StandardNormal)),
    );

    let mut indicators = Array2::zeros((n, p));
    for j in 0..p {
        let loading = loadings[j];
        // Nonnegative by the loading bound above.
        let noise_sd = (1.0 - loading * loading).sqrt();
        for i in 0..n {
            let z: f64 = rng.sample(StandardNormal);
            indicators[[i, j]] = factor[i] * loading + noise_sd * z;
        }
    }

    let factor_std = standardize(factor.view())?;
    let outcome = Array1::from_iter((0..n).map(|i| {
        let e: f64 = rng.sample(StandardNormal);
        INTERCEPT + condition.effect_size * factor_std[i] + e
    }));

    Ok(Replicate {
        condition: *condition,
        factor,
        loadings,
        indicators,
        outcome,
    })
}
