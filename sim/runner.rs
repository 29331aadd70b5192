//! # Grid Execution
//!
//! Drives the full factorial study: every (condition, replicate) cell is an
//! independent unit of work with its own derived seed, dispatched over the
//! rayon pool. Workers share only read-only condition parameters and the two
//! fitter configurations; results are grouped by condition index — a stable
//! key — never by completion order, which is nondeterministic under
//! parallelism.
//!
//! Long grids checkpoint through a CSV file: one row is appended as each
//! condition completes, and a resumed run skips every condition whose design
//! key is already present. Seeds derive from the position of a condition in
//! the full enumeration, so a resumed run reproduces exactly the replicates
//! the interrupted run would have produced.

use crate::aggregate::{self, ConditionSummary};
use crate::estimate::{run_replicate, Method, ReplicateResult};
use crate::fa::MlFactorAnalysis;
use crate::generate::GenerationError;
use crate::grid::{replicate_seed, Condition};
use crate::sem::MlSemFitter;
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint CSV failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("checkpoint writer lock was poisoned by a worker panic")]
    WriterPoisoned,
}

/// Run-level parameters. Deserializable so a TOML run file can carry them.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Replicates per condition.
    pub replications: usize,
    /// Base seed; every (condition, replicate) seed derives from it.
    pub base_seed: u64,
    /// Wall-clock budget per SEM fit in milliseconds; 0 disables the guard.
    pub sem_time_budget_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            replications: 1000,
            base_seed: 42,
            sem_time_budget_ms: 2000,
        }
    }
}

impl SimulationConfig {
    pub fn sem_fitter(&self) -> MlSemFitter {
        MlSemFitter {
            time_budget: if self.sem_time_budget_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(self.sem_time_budget_ms))
            },
            ..MlSemFitter::default()
        }
    }
}

/// Runs every replicate of one condition in parallel and folds them into a
/// summary. `condition_index` must be the condition's position in the full
/// enumeration so seeds stay stable across partial runs.
pub fn run_condition(
    condition: &Condition,
    condition_index: usize,
    config: &SimulationConfig,
) -> Result<ConditionSummary, GenerationError> {
    let extractor = MlFactorAnalysis::default();
    let fitter = config.sem_fitter();
    let results: Vec<ReplicateResult> = (0..config.replications)
        .into_par_iter()
        .map(|r| {
            let seed = replicate_seed(config.base_seed, condition_index, r);
            run_replicate(condition, seed, &extractor, &fitter)
        })
        .collect::<Result<_, _>>()?;
    let summary = aggregate::summarize(condition, &results);
    log::info!(
        "condition [{}] done: SEM failure rate {:.1}%, mean reliability {:.3}",
        condition.key(),
        summary.method(Method::Sem).failure_rate * 100.0,
        summary.mean_reliability.unwrap_or(f64::NAN),
    );
    Ok(summary)
}

/// Runs a list of conditions in parallel, returning summaries in input order.
pub fn run_grid(
    config: &SimulationConfig,
    conditions: &[Condition],
    progress: Option<&ProgressBar>,
) -> Result<Vec<ConditionSummary>, GenerationError> {
    conditions
        .par_iter()
        .enumerate()
        .map(|(index, condition)| {
            let summary = run_condition(condition, index, config)?;
            if let Some(bar) = progress {
                bar.inc(1);
            }
            Ok(summary)
        })
        .collect()
}

/// Runs the grid against a CSV checkpoint, skipping conditions already
/// summarized there and appending a row as each new condition completes.
/// Returns the newly computed summaries (completion order).
pub fn run_grid_resumable(
    config: &SimulationConfig,
    conditions: &[Condition],
    checkpoint: &Path,
    progress: Option<&ProgressBar>,
) -> Result<Vec<ConditionSummary>, RunnerError> {
    let completed: HashSet<String> = if checkpoint.exists() {
        let keys = aggregate::read_completed_keys(checkpoint)?;
        log::info!(
            "resuming: {} of {} conditions already checkpointed",
            keys.len(),
            conditions.len()
        );
        keys
    } else {
        HashSet::new()
    };

    let pending: Vec<(usize, Condition)> = conditions
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, c)| !completed.contains(&c.key()))
        .collect();
    if let Some(bar) = progress {
        bar.inc(completed.len().min(conditions.len()) as u64);
    }

    let fresh_file = !checkpoint.exists()
        || std::fs::metadata(checkpoint).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(checkpoint)?;
    let mut writer = csv::Writer::from_writer(file);
    if fresh_file {
        writer.write_record(aggregate::csv_header())?;
        writer.flush()?;
    }
    let shared_writer = Mutex::new(writer);

    let summaries: Vec<ConditionSummary> = pending
        .par_iter()
        .map(|&(index, condition)| -> Result<ConditionSummary, RunnerError> {
            let summary = run_condition(&condition, index, config)?;
            {
                let mut guard = shared_writer
                    .lock()
                    .map_err(|_| RunnerError::WriterPoisoned)?;
                guard.write_record(aggregate::csv_record(&summary))?;
                guard.flush()?;
            }
            if let Some(bar) = progress {
                bar.inc(1);
            }
            Ok(summary)
        })
        .collect::<Result<_, _>>()?;

    Ok(summaries)
}
